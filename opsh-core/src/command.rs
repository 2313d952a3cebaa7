//! Remote shell command builder
//!
//! Commands run through the remote user's shell, so every argument passed via
//! [`RemoteCommand::arg`] is quoted unless it consists only of characters the
//! shell treats literally. Use [`RemoteCommand::raw`] for operators and globs.

use std::fmt;

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(is_shell_safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn is_shell_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'_' | b'.' | b'/' | b':' | b'=' | b'@' | b',' | b'+' | b'%'
        )
}

/// A shell command line assembled from quoted parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    line: String,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            line: shell_quote(program),
        }
    }

    /// Append one quoted argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.line.push(' ');
        self.line.push_str(&shell_quote(arg.as_ref()));
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().fold(self, |cmd, a| cmd.arg(a))
    }

    /// Append `text` verbatim.
    pub fn raw(mut self, text: &str) -> Self {
        self.line.push(' ');
        self.line.push_str(text);
        self
    }

    /// Run in `dir` (`cd <dir> && ...`).
    pub fn in_dir(self, dir: &str) -> Self {
        Self {
            line: format!("cd {} && {}", shell_quote(dir), self.line),
        }
    }

    /// `self && next`
    pub fn and(self, next: RemoteCommand) -> Self {
        Self {
            line: format!("{} && {}", self.line, next.line),
        }
    }

    /// `self | next`
    pub fn pipe(self, next: RemoteCommand) -> Self {
        Self {
            line: format!("{} | {}", self.line, next.line),
        }
    }

    pub fn redirect_stderr_to_stdout(self) -> Self {
        self.raw("2>&1")
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl AsRef<str> for RemoteCommand {
    fn as_ref(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
