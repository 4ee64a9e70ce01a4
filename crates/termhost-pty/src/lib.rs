//! termhost-pty: terminal backends and session lifecycle for termhost.
//!
//! This crate decides which pseudo-terminal mechanism the host can use,
//! launches shells on it, and turns their blocking output into events.
//!
//! # Architecture
//!
//! - [`Detector`]: Probes the platform and ranks usable backends.
//! - [`Backend`]: One running process; implemented by [`PtyBackend`]
//!   (Unix pty, ConPTY) and [`ProcessBackend`] (winpty launcher, plain pipes).
//! - [`SessionFactory`]: Combines detection and launching into a
//!   [`TerminalSession`].
//! - [`TerminalSession`]: The uniform spawn/write/resize/kill wrapper whose
//!   output arrives as [`SessionEvent`]s from dedicated I/O threads.

pub mod backend;
pub mod capability;
pub mod factory;
pub mod io_thread;
pub mod process;
pub mod pty;
pub mod session;

pub use backend::{Backend, BackendIo, ExitInfo, PtyError, ResolvedOptions, SpawnOptions};
pub use capability::{
    describe_capabilities, select_backend, BackendKind, CapabilityDescriptor, Detector,
    PlatformInfo, Reliability,
};
pub use factory::{CreatedSession, Launcher, NativeLauncher, SessionFactory};
pub use io_thread::{SessionEvent, SessionEventKind, SessionTag};
pub use process::ProcessBackend;
pub use pty::PtyBackend;
pub use session::TerminalSession;
