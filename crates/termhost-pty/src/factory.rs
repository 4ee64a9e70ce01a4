use crate::backend::{Backend, PtyError, ResolvedOptions, SpawnOptions};
use crate::capability::{
    describe_capabilities, BackendKind, CapabilityDescriptor, Detector, Reliability,
};
use crate::process::ProcessBackend;
use crate::pty::PtyBackend;
use crate::session::TerminalSession;

/// Builds the concrete backend process for a backend kind.
pub trait Launcher: Send {
    fn launch(
        &self,
        kind: BackendKind,
        opts: &ResolvedOptions,
    ) -> Result<Box<dyn Backend>, PtyError>;
}

/// Launches real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

impl Launcher for NativeLauncher {
    fn launch(
        &self,
        kind: BackendKind,
        opts: &ResolvedOptions,
    ) -> Result<Box<dyn Backend>, PtyError> {
        let backend: Box<dyn Backend> = match kind {
            BackendKind::NativePty | BackendKind::WindowsConpty => {
                Box::new(PtyBackend::spawn(opts)?)
            }
            BackendKind::WindowsWinpty => Box::new(ProcessBackend::spawn_winpty(opts)?),
            BackendKind::Subprocess => Box::new(ProcessBackend::spawn(opts)?),
        };
        Ok(backend)
    }
}

/// A freshly constructed session, not yet spawned.
pub struct CreatedSession {
    pub session: TerminalSession,
    pub descriptor: CapabilityDescriptor,
    /// Set whenever the chosen backend is less than highly reliable.
    pub fallback_reason: Option<String>,
}

/// Picks a backend through the detector and constructs sessions on it.
pub struct SessionFactory {
    detector: Detector,
    launcher: Box<dyn Launcher>,
}

impl SessionFactory {
    pub fn new(detector: Detector, launcher: Box<dyn Launcher>) -> Self {
        Self { detector, launcher }
    }

    /// Factory that probes the running host and launches real processes.
    pub fn native() -> Self {
        Self::new(Detector::new(), Box::new(NativeLauncher))
    }

    pub fn create_session(&mut self, options: SpawnOptions) -> Result<CreatedSession, PtyError> {
        let descriptor = self.detector.detect_best_backend();
        let options = options.resolve();
        let backend = self.launcher.launch(descriptor.backend, &options)?;

        let fallback_reason = (descriptor.reliability < Reliability::High).then(|| {
            format!(
                "no high-reliability terminal backend available; using {}",
                describe_capabilities(&descriptor)
            )
        });

        Ok(CreatedSession {
            session: TerminalSession::new(backend, descriptor, options),
            descriptor,
            fallback_reason,
        })
    }

    /// Forget the cached backend choice and detect again.
    pub fn refresh_capabilities(&mut self) -> CapabilityDescriptor {
        self.detector.refresh()
    }
}
