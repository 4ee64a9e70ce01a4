use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from backend operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resize failed: {0}")]
    ResizeFailed(String),
    #[error("kill failed: {0}")]
    KillFailed(String),
}

/// Default terminal width when the caller does not supply one.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height when the caller does not supply one.
pub const DEFAULT_ROWS: u16 = 24;

/// Caller-supplied spawn options. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Spawn options with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnOptions {
    pub fn resolve(self) -> ResolvedOptions {
        let shell = self
            .shell
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_shell);
        let cwd = self.cwd.unwrap_or_else(default_cwd);
        ResolvedOptions {
            shell,
            cwd,
            env: self.env,
            cols: self.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            rows: self.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
        }
    }
}

/// Returns the user's default shell.
///
/// `$SHELL` or `/bin/sh` on Unix; `%COMSPEC%` or `powershell.exe` on Windows.
pub fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn default_cwd() -> PathBuf {
    std::env::current_dir()
        .ok()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// How a backend process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Blocks until the backend process exits.
pub type ExitWaiter = Box<dyn FnOnce() -> ExitInfo + Send>;

/// The blocking halves of a backend, handed to the I/O threads once.
pub struct BackendIo {
    pub readers: Vec<Box<dyn Read + Send>>,
    pub waiter: ExitWaiter,
}

/// Common interface over every concrete backend process.
pub trait Backend: Send {
    /// OS process id, when the backend knows it.
    fn pid(&self) -> Option<u32>;

    /// Write raw input to the process.
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    /// Resize the terminal. Backends without resize support return `Ok`.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Terminate the process.
    fn kill(&mut self) -> Result<(), PtyError>;

    /// Take the readers and exit waiter. Returns `None` after the first call.
    fn take_io(&mut self) -> Option<BackendIo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_fills_defaults() {
        let resolved = SpawnOptions::default().resolve();
        assert!(!resolved.shell.is_empty());
        assert_eq!(resolved.cols, DEFAULT_COLS);
        assert_eq!(resolved.rows, DEFAULT_ROWS);
    }

    #[test]
    fn test_resolve_keeps_caller_values() {
        let opts = SpawnOptions {
            shell: Some("/bin/bash".to_string()),
            cwd: Some(PathBuf::from("/tmp")),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            cols: Some(120),
            rows: Some(40),
        };
        let resolved = opts.resolve();
        assert_eq!(resolved.shell, "/bin/bash");
        assert_eq!(resolved.cwd, PathBuf::from("/tmp"));
        assert_eq!(resolved.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!((resolved.cols, resolved.rows), (120, 40));
    }

    #[test]
    fn test_resolve_ignores_blank_shell_and_zero_size() {
        let opts = SpawnOptions {
            shell: Some("   ".to_string()),
            cols: Some(0),
            rows: Some(0),
            ..Default::default()
        };
        let resolved = opts.resolve();
        assert_eq!(resolved.shell, default_shell());
        assert_eq!((resolved.cols, resolved.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_shell_is_absolute() {
        let shell = default_shell();
        assert!(
            shell.starts_with('/'),
            "Default shell should be an absolute path, got: {shell}"
        );
    }
}
