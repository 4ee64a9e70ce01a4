use std::path::Path;

use tokio::sync::mpsc;

use crate::backend::{Backend, PtyError, ResolvedOptions};
use crate::capability::CapabilityDescriptor;
use crate::io_thread::{start_io_threads, SessionEvent, SessionTag};

/// A backend process behind the uniform session interface.
///
/// Output and lifecycle changes are not pulled from the session; once
/// [`spawn`](Self::spawn) has run they arrive as [`SessionEvent`]s on the
/// channel it was given.
pub struct TerminalSession {
    backend: Box<dyn Backend>,
    descriptor: CapabilityDescriptor,
    options: ResolvedOptions,
    running: bool,
}

impl TerminalSession {
    pub fn new(
        backend: Box<dyn Backend>,
        descriptor: CapabilityDescriptor,
        options: ResolvedOptions,
    ) -> Self {
        Self {
            backend,
            descriptor,
            options,
            running: false,
        }
    }

    /// Start streaming events for this session and mark it running.
    ///
    /// Calling it again on a running session does nothing.
    pub fn spawn(
        &mut self,
        tag: SessionTag,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), PtyError> {
        if self.running {
            return Ok(());
        }
        if let Some(io) = self.backend.take_io() {
            start_io_threads(tag, io, events)?;
        }
        self.running = true;
        Ok(())
    }

    /// Write user input. Ignored unless the session is running.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.running {
            return Ok(());
        }
        self.backend.write(data)
    }

    /// Resize the terminal. Ignored when the backend cannot resize.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.running || !self.descriptor.supports_resize {
            return Ok(());
        }
        self.backend.resize(cols, rows)?;
        self.options.cols = cols;
        self.options.rows = rows;
        Ok(())
    }

    /// Terminate the process and mark the session not running.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        let was_running = std::mem::replace(&mut self.running, false);
        if was_running {
            self.backend.kill()?;
        }
        Ok(())
    }

    /// Record that the process exited on its own.
    pub fn mark_exited(&mut self) {
        self.running = false;
    }

    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn shell(&self) -> &str {
        &self.options.shell
    }

    pub fn cwd(&self) -> &Path {
        &self.options.cwd
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        (self.options.cols, self.options.rows)
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            log::warn!("failed to kill {} on drop: {e}", self.options.shell);
        }
    }
}
