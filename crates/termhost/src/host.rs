//! The session host: a table of running sessions driven by control messages.
//!
//! All session state is owned by [`Host`] and mutated only from its own
//! handlers on the host task. Backend output arrives as [`SessionEvent`]s,
//! passes through the [`EchoGuard`], and is forwarded upstream in bounded
//! chunks, one chunk per session per turn of the run loop.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use termhost_pty::{
    describe_capabilities, ExitInfo, PtyError, SessionEvent, SessionEventKind, SessionFactory,
    SessionTag, TerminalSession,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::HostConfig;
use crate::guard::{EchoGuard, Verdict};
use crate::ipc::{ControlMessage, ControlResponse, CreateOptions, TerminalInfo};
use crate::output::OutputBuffer;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

struct HostedSession {
    session: TerminalSession,
    output: OutputBuffer,
    guard: EchoGuard,
    generation: u64,
}

pub struct Host {
    factory: SessionFactory,
    sessions: HashMap<String, HostedSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedSender<ControlResponse>,
    config: HostConfig,
    next_generation: u64,
}

impl Host {
    pub fn new(
        factory: SessionFactory,
        config: HostConfig,
        outbound: mpsc::UnboundedSender<ControlResponse>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            outbound,
            config,
            next_generation: 0,
        }
    }

    /// Serve until the inbound channel closes or `shutdown` resolves, then
    /// kill every remaining session.
    pub async fn run<S>(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<ControlMessage>,
        shutdown: S,
    ) where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let draining = self.has_pending_output();
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("termination requested");
                    break;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                message = inbound.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        log::info!("control channel closed");
                        break;
                    }
                },
                _ = tokio::task::yield_now(), if draining => self.drain_once(),
            }
        }
        self.shutdown();
    }

    pub fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Create { id, options } => match self.create(&id, options) {
                Ok(created) => self.emit(created),
                Err(e) => {
                    log::warn!("create {id} failed: {e}");
                    self.emit(ControlResponse::error(id, e));
                }
            },
            ControlMessage::Write { id, data } => {
                if let Err(e) = self.write(&id, data.as_bytes()) {
                    self.report(id, e);
                }
            }
            ControlMessage::Resize { id, cols, rows } => {
                if let Err(e) = self.resize(&id, cols, rows) {
                    self.report(id, e);
                }
            }
            ControlMessage::Kill { id } => match self.kill(&id) {
                Ok(()) => self.emit(ControlResponse::Killed { id }),
                Err(e) => self.report(id, e),
            },
            ControlMessage::List { id } => {
                let terminals = self.list();
                self.emit(ControlResponse::List {
                    request_id: id,
                    terminals,
                });
            }
        }
    }

    fn create(&mut self, id: &str, options: CreateOptions) -> Result<ControlResponse, HostError> {
        if self.sessions.contains_key(id) {
            return Err(HostError::SessionExists(id.to_string()));
        }
        let created = self.factory.create_session(options.into())?;
        let mut session = created.session;

        self.next_generation += 1;
        let generation = self.next_generation;
        let tag = SessionTag {
            id: id.to_string(),
            generation,
        };
        session.spawn(tag, self.events_tx.clone())?;

        let descriptor = created.descriptor;
        if let Some(reason) = &created.fallback_reason {
            log::warn!("session {id}: {reason}");
        }
        log::info!(
            "session {id} started: {} in {} (pid {:?}, {})",
            session.shell(),
            session.cwd().display(),
            session.pid(),
            describe_capabilities(&descriptor)
        );

        let response = ControlResponse::Created {
            id: id.to_string(),
            shell: session.shell().to_string(),
            cwd: session.cwd().display().to_string(),
            pid: session.pid(),
            strategy: descriptor.backend.strategy().to_string(),
            backend: descriptor.backend,
            capabilities: descriptor,
            fallback_reason: created.fallback_reason,
        };
        self.sessions.insert(
            id.to_string(),
            HostedSession {
                session,
                output: OutputBuffer::new(),
                guard: EchoGuard::new(self.config.suppression),
                generation,
            },
        );
        Ok(response)
    }

    fn write(&mut self, id: &str, data: &[u8]) -> Result<(), HostError> {
        let hosted = self.session_mut(id)?;
        hosted.session.write(data)?;
        Ok(())
    }

    fn resize(&mut self, id: &str, cols: u16, rows: u16) -> Result<(), HostError> {
        let hosted = self.session_mut(id)?;
        if !hosted.session.descriptor().supports_resize {
            log::debug!("session {id}: backend cannot resize; ignoring {cols}x{rows}");
        }
        hosted.session.resize(cols, rows)?;
        Ok(())
    }

    fn kill(&mut self, id: &str) -> Result<(), HostError> {
        let mut hosted = self
            .sessions
            .remove(id)
            .ok_or_else(|| HostError::SessionNotFound(id.to_string()))?;
        self.flush(id, &mut hosted.output);
        hosted.session.kill()?;
        log::info!("session {id} killed");
        Ok(())
    }

    /// Running sessions, ordered by id.
    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut terminals: Vec<TerminalInfo> = self
            .sessions
            .iter()
            .map(|(id, hosted)| TerminalInfo {
                id: id.clone(),
                shell: hosted.session.shell().to_string(),
                cwd: hosted.session.cwd().display().to_string(),
                pid: hosted.session.pid(),
            })
            .collect();
        terminals.sort_by(|a, b| a.id.cmp(&b.id));
        terminals
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { tag, kind } = event;
        match self.sessions.get(&tag.id) {
            Some(hosted) if hosted.generation == tag.generation => {}
            _ => {
                log::debug!("dropping event for stale session {} #{}", tag.id, tag.generation);
                return;
            }
        }
        match kind {
            SessionEventKind::Data(data) => self.accept_output(&tag.id, data),
            SessionEventKind::Exit(info) => self.finish(&tag.id, info),
            SessionEventKind::Error(error) => {
                log::warn!("session {}: {error}", tag.id);
                self.emit(ControlResponse::error(tag.id, error));
            }
        }
    }

    fn accept_output(&mut self, id: &str, data: String) {
        let Some(hosted) = self.sessions.get_mut(id) else {
            return;
        };
        match hosted.guard.check(&data, Instant::now()) {
            Verdict::Forward => {
                hosted.output.push(data);
                log::trace!("session {id}: {} bytes buffered", hosted.output.len());
            }
            Verdict::Duplicate => {
                log::debug!("session {id}: dropped repeated chunk ({} bytes)", data.len())
            }
            Verdict::Loop => {
                log::debug!("session {id}: dropped resize echo ({} bytes)", data.len())
            }
        }
    }

    fn finish(&mut self, id: &str, info: ExitInfo) {
        let Some(mut hosted) = self.sessions.remove(id) else {
            return;
        };
        hosted.session.mark_exited();
        self.flush(id, &mut hosted.output);
        log::info!(
            "session {id} exited (code {:?}, signal {:?})",
            info.code,
            info.signal
        );
        self.emit(ControlResponse::Exit {
            id: id.to_string(),
            exit_code: info.code,
            signal: info.signal,
        });
    }

    /// Forward at most one chunk from every session with buffered output.
    pub fn drain_once(&mut self) {
        let chunk_size = self.config.chunk_size;
        let mut chunks: Vec<(String, String)> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, hosted)| Some((id.clone(), hosted.output.take_chunk(chunk_size)?)))
            .collect();
        chunks.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, data) in chunks {
            self.emit(ControlResponse::Data { id, data });
        }
    }

    pub fn has_pending_output(&self) -> bool {
        self.sessions.values().any(|hosted| !hosted.output.is_empty())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Kill every session and empty the table.
    pub fn shutdown(&mut self) {
        let count = self.session_count();
        for (id, mut hosted) in self.sessions.drain() {
            if let Err(e) = hosted.session.kill() {
                log::warn!("failed to kill session {id}: {e}");
            }
        }
        if count > 0 {
            log::info!("shut down {count} session(s)");
        }
    }

    fn flush(&self, id: &str, output: &mut OutputBuffer) {
        while let Some(data) = output.take_chunk(self.config.chunk_size) {
            self.emit(ControlResponse::Data {
                id: id.to_string(),
                data,
            });
        }
    }

    fn session_mut(&mut self, id: &str) -> Result<&mut HostedSession, HostError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| HostError::SessionNotFound(id.to_string()))
    }

    /// Log a failed command. Only backend failures are reported upstream;
    /// commands for unknown sessions are ignored.
    fn report(&self, id: String, error: HostError) {
        log::warn!("{id}: {error}");
        if matches!(error, HostError::Pty(_)) {
            self.emit(ControlResponse::error(id, error));
        }
    }

    fn emit(&self, response: ControlResponse) {
        if self.outbound.send(response).is_err() {
            log::warn!("outbound channel closed; dropping response");
        }
    }
}
