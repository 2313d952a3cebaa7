use std::fmt::Display;
use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use console::{colors_enabled, style};
use indicatif::{ProgressBar, ProgressStyle};
use opsh_core::{CommandResult, OutputStream};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn brand_accent<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).cyan()
}

pub fn brand_fg<D: Display>(value: D) -> console::StyledObject<D> {
    style(value)
}

pub fn brand_muted<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).dim()
}

pub fn brand_success<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).green()
}

pub fn brand_warning<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).yellow()
}

pub fn brand_error<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).red()
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}

pub fn section(title: &str) {
    println!();
    println!("{}", brand_accent(title).bold());
}

pub fn step(message: &str) {
    println!("{} {}", brand_accent("•").bold(), brand_fg(message));
}

pub fn success(message: &str) {
    println!("{} {}", brand_success("✓").bold(), brand_fg(message));
}

pub fn warning(message: &str) {
    println!("{} {}", brand_warning("!").bold(), brand_fg(message));
}

pub fn error(message: &str) {
    println!("{} {}", brand_error("✗").bold(), brand_fg(message));
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", brand_error("✗").bold(), brand_fg(message));
}

pub fn muted(message: &str) {
    println!("{}", brand_muted(message));
}

pub fn emphasized(value: &str) -> String {
    if std::io::stdout().is_terminal() && colors_enabled() {
        format!("\x1b[3m{}\x1b[23m", value)
    } else {
        format!("'{}'", value)
    }
}

/// Print captured command output: stdout as-is, stderr dimmed.
pub fn command_output(result: &CommandResult) {
    let stdout = result.stdout_lossy();
    if !stdout.is_empty() {
        print!("{}", stdout);
        if !stdout.ends_with('\n') {
            println!();
        }
    }
    let stderr = result.stderr_lossy();
    for line in stderr.lines() {
        println!("{}", brand_muted(line));
    }
}

/// Sink for streamed chunks; stdout and stderr go to the matching local stream.
pub fn stream_chunk(stream: OutputStream, data: &[u8]) {
    match stream {
        OutputStream::Stdout => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(data);
            let _ = out.flush();
        }
        OutputStream::Stderr => {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(data);
            let _ = err.flush();
        }
    }
}

/// Byte progress bar for a transfer; hidden when not attached to a terminal.
pub fn transfer_progress(label: &str) -> ProgressBar {
    if !is_interactive() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
    {
        pb.set_style(bar_style.progress_chars("=>-"));
    }
    pb.set_message(label.to_string());
    pb
}

pub fn human_bytes(bytes: u64) -> String {
    indicatif::HumanBytes(bytes).to_string()
}
