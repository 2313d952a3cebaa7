use opsh_core::{CommandResult, RemoteCommand, RemoteSession};

use super::{CommandError, connect, run_checked};
use crate::config::Target;
use crate::output;

fn ufw_active(status: &CommandResult) -> bool {
    status.success() && reports_active(&status.stdout_lossy())
}

fn reports_active(ufw_status: &str) -> bool {
    ufw_status
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("status: active"))
}

/// Commands that open `port` for inbound TCP.
fn open_port_commands(port: u16, ufw: bool) -> Vec<RemoteCommand> {
    if ufw {
        vec![
            RemoteCommand::new("ufw")
                .arg("allow")
                .arg(format!("{}/tcp", port)),
            RemoteCommand::new("ufw").arg("reload"),
        ]
    } else {
        vec![
            RemoteCommand::new("iptables")
                .args(["-I", "INPUT", "-p", "tcp", "--dport"])
                .arg(port.to_string())
                .args(["-j", "ACCEPT"]),
        ]
    }
}

pub fn run(target: Target, port: u16) -> Result<(), CommandError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = connect(&target).await?;
        let outcome = open_port(&session, port).await;
        session.close().await;
        outcome
    })
}

async fn open_port(session: &RemoteSession, port: u16) -> Result<(), CommandError> {
    output::section("Firewall");
    let status = session.run("ufw status").await?;
    let ufw = ufw_active(&status);
    if ufw {
        output::step("ufw is active");
    } else {
        output::step("ufw is not active; using iptables");
    }

    for command in open_port_commands(port, ufw) {
        output::step(command.as_str());
        let result = run_checked(session, &command).await?;
        output::command_output(&result);
    }

    output::success(&format!("Port {}/tcp is open", port));
    Ok(())
}
