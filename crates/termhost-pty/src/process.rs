//! Pipe-backed backends for hosts without a usable pseudo-terminal.
//!
//! Neither variant can resize. The winpty variant runs the shell under
//! `winpty.exe`, which gives console programs a hidden console and relays it
//! over plain pipes.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{Backend, BackendIo, ExitInfo, PtyError, ResolvedOptions};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// A shell driven over stdin/stdout/stderr pipes.
pub struct ProcessBackend {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    pid: u32,
    io: Option<BackendIo>,
}

impl ProcessBackend {
    /// Spawn the shell directly with piped stdio.
    pub fn spawn(opts: &ResolvedOptions) -> Result<Self, PtyError> {
        let mut cmd = Command::new(&opts.shell);
        Self::launch(&mut cmd, opts)
    }

    /// Spawn the shell through the winpty launcher.
    pub fn spawn_winpty(opts: &ResolvedOptions) -> Result<Self, PtyError> {
        let mut cmd = Command::new("winpty.exe");
        cmd.args(["-Xallow-non-tty", "-Xplain", "-Xcolor"])
            .arg(&opts.shell);
        Self::launch(&mut cmd, opts)
    }

    fn launch(cmd: &mut Command, opts: &ResolvedOptions) -> Result<Self, PtyError> {
        cmd.current_dir(&opts.cwd)
            .envs(&opts.env)
            .env("COLUMNS", opts.cols.to_string())
            .env("LINES", opts.rows.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {}: {e}", opts.shell)))?;

        let stdin = child.stdin.take();
        let mut readers: Vec<Box<dyn Read + Send>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Box::new(stderr));
        }

        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let waited = Arc::clone(&child);

        Ok(Self {
            child,
            stdin,
            pid,
            io: Some(BackendIo {
                readers,
                waiter: Box::new(move || wait_child(&waited)),
            }),
        })
    }
}

/// Poll the child so the lock stays free for `kill`.
fn wait_child(child: &Mutex<Child>) -> ExitInfo {
    loop {
        let polled = match child.lock() {
            Ok(mut c) => c.try_wait(),
            Err(_) => return ExitInfo::default(),
        };
        match polled {
            Ok(Some(status)) => return exit_info(status),
            Ok(None) => std::thread::sleep(WAIT_POLL),
            Err(e) => {
                log::warn!("failed to poll child process: {e}");
                return ExitInfo::default();
            }
        }
    }
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;

    ExitInfo {
        code: status.code(),
        signal: status.signal().map(signal_name),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

impl Backend for ProcessBackend {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), PtyError> {
        Ok(())
    }

    fn kill(&mut self) -> Result<(), PtyError> {
        // Closing stdin lets well-behaved shells exit on their own.
        self.stdin = None;
        let mut child = self
            .child
            .lock()
            .map_err(|_| PtyError::KillFailed("child lock poisoned".to_string()))?;
        match child.kill() {
            Ok(()) => Ok(()),
            // Already exited and reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(PtyError::KillFailed(format!("{e}"))),
        }
    }

    fn take_io(&mut self) -> Option<BackendIo> {
        self.io.take()
    }
}
