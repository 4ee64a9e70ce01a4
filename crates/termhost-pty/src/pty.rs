use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

use crate::backend::{Backend, BackendIo, ExitInfo, PtyError, ResolvedOptions};

const WAIT_POLL: Duration = Duration::from_millis(50);

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// A shell running on the OS pseudo-terminal (a Unix pty or Windows ConPTY).
pub struct PtyBackend {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: SharedChild,
    pid: Option<u32>,
    io: Option<BackendIo>,
}

impl PtyBackend {
    /// Open a pty with the requested size and spawn the shell on it.
    pub fn spawn(opts: &ResolvedOptions) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(opts.cols, opts.rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&opts.shell);
        cmd.cwd(&opts.cwd);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {}: {e}", opts.shell)))?;
        // The slave end belongs to the child now; holding it open would keep
        // the reader from seeing EOF after the shell exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let pid = child.process_id();
        let child = Arc::new(Mutex::new(child));
        let waited = Arc::clone(&child);

        Ok(Self {
            master: pair.master,
            writer,
            child,
            pid,
            io: Some(BackendIo {
                readers: vec![reader],
                waiter: Box::new(move || wait_child(&waited)),
            }),
        })
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Poll the child so the lock stays free for `kill`.
fn wait_child(child: &Mutex<Box<dyn Child + Send + Sync>>) -> ExitInfo {
    loop {
        let polled = match child.lock() {
            Ok(mut c) => c.try_wait(),
            Err(_) => return ExitInfo::default(),
        };
        match polled {
            Ok(Some(status)) => {
                return ExitInfo {
                    code: Some(status.exit_code() as i32),
                    signal: status.signal().map(str::to_string),
                }
            }
            Ok(None) => std::thread::sleep(WAIT_POLL),
            Err(e) => {
                log::warn!("failed to wait for pty child: {e}");
                return ExitInfo::default();
            }
        }
    }
}

impl Backend for PtyBackend {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// On Unix the child gets SIGHUP and a short grace period before
    /// SIGKILL.
    fn kill(&mut self) -> Result<(), PtyError> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| PtyError::KillFailed("child lock poisoned".to_string()))?;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        ChildKiller::kill(&mut **child).map_err(|e| PtyError::KillFailed(format!("{e}")))
    }

    fn take_io(&mut self) -> Option<BackendIo> {
        self.io.take()
    }
}

/// Drain a reader until EOF. Test helper for backends that own their readers.
#[cfg(test)]
pub(crate) fn read_until(reader: &mut dyn Read, needle: &str) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                output.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&output).contains(needle) {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}
