//! Platform probing and backend selection.
//!
//! Detection never fails: when nothing better is usable the detector settles
//! on [`BackendKind::Subprocess`] with low reliability.

use std::fmt;

use serde::Serialize;

/// First Windows 10 build that ships the ConPTY console API.
pub const CONPTY_MIN_BUILD: u32 = 17763;

/// The closed set of backends a session can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    NativePty,
    WindowsConpty,
    WindowsWinpty,
    Subprocess,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::NativePty => "native-pty",
            BackendKind::WindowsConpty => "windows-conpty",
            BackendKind::WindowsWinpty => "windows-winpty",
            BackendKind::Subprocess => "subprocess",
        }
    }

    /// Name of the mechanism that actually drives the process.
    pub fn strategy(self) -> &'static str {
        match self {
            BackendKind::NativePty => "portable-pty",
            BackendKind::WindowsConpty => "conpty",
            BackendKind::WindowsWinpty => "winpty",
            BackendKind::Subprocess => "child-process",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reliability tier, ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Low,
    Medium,
    High,
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reliability::Low => "low",
            Reliability::Medium => "medium",
            Reliability::High => "high",
        })
    }
}

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub backend: BackendKind,
    pub supports_resize: bool,
    pub supports_color: bool,
    pub interactive: bool,
    pub supports_history: bool,
    pub reliability: Reliability,
}

impl CapabilityDescriptor {
    /// The fixed descriptor for a backend kind.
    pub fn for_kind(backend: BackendKind) -> Self {
        match backend {
            BackendKind::NativePty | BackendKind::WindowsConpty => Self {
                backend,
                supports_resize: true,
                supports_color: true,
                interactive: true,
                supports_history: true,
                reliability: Reliability::High,
            },
            BackendKind::WindowsWinpty => Self {
                backend,
                supports_resize: false,
                supports_color: true,
                interactive: true,
                supports_history: false,
                reliability: Reliability::Medium,
            },
            BackendKind::Subprocess => Self {
                backend,
                supports_resize: false,
                supports_color: false,
                interactive: false,
                supports_history: false,
                reliability: Reliability::Low,
            },
        }
    }

    fn features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.supports_resize {
            features.push("resize");
        }
        if self.supports_color {
            features.push("color");
        }
        if self.interactive {
            features.push("interactive");
        }
        if self.supports_history {
            features.push("history");
        }
        features
    }
}

/// Human-readable summary for logs, e.g.
/// `native-pty (high reliability): resize, color, interactive, history`.
pub fn describe_capabilities(descriptor: &CapabilityDescriptor) -> String {
    let features = descriptor.features();
    let features = if features.is_empty() {
        "none".to_string()
    } else {
        features.join(", ")
    };
    format!(
        "{} ({} reliability): {}",
        descriptor.backend, descriptor.reliability, features
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Unix,
    Other,
}

/// Facts about the host that backend selection depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: OsFamily,
    /// Windows build number (`10.0.<build>`), when it could be read.
    pub windows_build: Option<u32>,
    /// A native pty could be opened.
    pub native_pty_loadable: bool,
    /// The winpty launcher and agent are on `PATH`.
    pub winpty_loadable: bool,
}

impl PlatformInfo {
    /// Probe the running host.
    pub fn probe() -> Self {
        if cfg!(windows) {
            Self {
                os: OsFamily::Windows,
                windows_build: windows_build_number(),
                native_pty_loadable: false,
                winpty_loadable: winpty_on_path(),
            }
        } else if cfg!(unix) {
            Self {
                os: OsFamily::Unix,
                windows_build: None,
                native_pty_loadable: native_pty_loadable(),
                winpty_loadable: false,
            }
        } else {
            Self {
                os: OsFamily::Other,
                windows_build: None,
                native_pty_loadable: false,
                winpty_loadable: false,
            }
        }
    }
}

/// Pick the most reliable usable backend for the given platform facts.
pub fn select_backend(info: &PlatformInfo) -> CapabilityDescriptor {
    let kind = match info.os {
        OsFamily::Windows => match info.windows_build {
            Some(build) if build >= CONPTY_MIN_BUILD => BackendKind::WindowsConpty,
            _ if info.winpty_loadable => BackendKind::WindowsWinpty,
            _ => BackendKind::Subprocess,
        },
        OsFamily::Unix if info.native_pty_loadable => BackendKind::NativePty,
        OsFamily::Unix | OsFamily::Other => BackendKind::Subprocess,
    };
    CapabilityDescriptor::for_kind(kind)
}

/// Extract the build number from `ver` output such as
/// `Microsoft Windows [Version 10.0.19045.3803]`.
pub fn parse_windows_build(ver_output: &str) -> Option<u32> {
    let start = ver_output.find(|c: char| c.is_ascii_digit())?;
    let version: String = ver_output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    version.split('.').nth(2)?.parse().ok()
}

fn windows_build_number() -> Option<u32> {
    let output = std::process::Command::new("cmd")
        .args(["/C", "ver"])
        .output()
        .ok()?;
    parse_windows_build(&String::from_utf8_lossy(&output.stdout))
}

fn winpty_on_path() -> bool {
    find_on_path("winpty.exe") && find_on_path("winpty-agent.exe")
}

/// Whether `name` exists in any `PATH` directory.
fn find_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

fn native_pty_loadable() -> bool {
    use portable_pty::{native_pty_system, PtySize};

    let probe = native_pty_system().openpty(PtySize {
        rows: 1,
        cols: 1,
        pixel_width: 0,
        pixel_height: 0,
    });
    match probe {
        Ok(_) => true,
        Err(e) => {
            log::warn!("native pty unavailable: {e}");
            false
        }
    }
}

type Probe = Box<dyn Fn() -> PlatformInfo + Send>;

/// Caches the detected backend for the lifetime of the detector.
pub struct Detector {
    probe: Probe,
    cached: Option<CapabilityDescriptor>,
}

impl Detector {
    /// Detector that probes the running host.
    pub fn new() -> Self {
        Self::with_probe(PlatformInfo::probe)
    }

    /// Detector with a custom probe.
    pub fn with_probe<F>(probe: F) -> Self
    where
        F: Fn() -> PlatformInfo + Send + 'static,
    {
        Self {
            probe: Box::new(probe),
            cached: None,
        }
    }

    /// The best usable backend. Probes once, then serves the cached result.
    pub fn detect_best_backend(&mut self) -> CapabilityDescriptor {
        if let Some(descriptor) = self.cached {
            return descriptor;
        }
        let info = (self.probe)();
        let descriptor = select_backend(&info);
        log::info!("backend detected: {}", describe_capabilities(&descriptor));
        self.cached = Some(descriptor);
        descriptor
    }

    /// Drop the cached result and detect again.
    pub fn refresh(&mut self) -> CapabilityDescriptor {
        self.cached = None;
        self.detect_best_backend()
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn windows(build: Option<u32>, winpty: bool) -> PlatformInfo {
        PlatformInfo {
            os: OsFamily::Windows,
            windows_build: build,
            native_pty_loadable: false,
            winpty_loadable: winpty,
        }
    }

    fn unix(pty: bool) -> PlatformInfo {
        PlatformInfo {
            os: OsFamily::Unix,
            windows_build: None,
            native_pty_loadable: pty,
            winpty_loadable: false,
        }
    }

    #[test]
    fn test_conpty_build_boundary() {
        assert_eq!(
            select_backend(&windows(Some(17762), false)).backend,
            BackendKind::Subprocess
        );
        assert_eq!(
            select_backend(&windows(Some(17762), true)).backend,
            BackendKind::WindowsWinpty
        );
        assert_eq!(
            select_backend(&windows(Some(17763), false)).backend,
            BackendKind::WindowsConpty
        );
        assert_eq!(
            select_backend(&windows(Some(22631), true)).backend,
            BackendKind::WindowsConpty
        );
    }

    #[test]
    fn test_unknown_windows_build_falls_back() {
        assert_eq!(
            select_backend(&windows(None, true)).backend,
            BackendKind::WindowsWinpty
        );
        let descriptor = select_backend(&windows(None, false));
        assert_eq!(descriptor.backend, BackendKind::Subprocess);
        assert_eq!(descriptor.reliability, Reliability::Low);
    }

    #[test]
    fn test_unix_selection() {
        assert_eq!(select_backend(&unix(true)).backend, BackendKind::NativePty);
        assert_eq!(select_backend(&unix(false)).backend, BackendKind::Subprocess);
    }

    #[test]
    fn test_other_platform_is_subprocess() {
        let info = PlatformInfo {
            os: OsFamily::Other,
            windows_build: None,
            native_pty_loadable: true,
            winpty_loadable: true,
        };
        assert_eq!(select_backend(&info).backend, BackendKind::Subprocess);
    }

    #[test]
    fn test_parse_windows_build() {
        assert_eq!(
            parse_windows_build("\r\nMicrosoft Windows [Version 10.0.19045.3803]\r\n"),
            Some(19045)
        );
        assert_eq!(
            parse_windows_build("Microsoft Windows [Version 10.0.17763.1]"),
            Some(17763)
        );
        assert_eq!(parse_windows_build("Microsoft Windows [Version 6.1]"), None);
        assert_eq!(parse_windows_build("garbage"), None);
        assert_eq!(parse_windows_build(""), None);
    }

    #[test]
    fn test_reliability_ordering() {
        assert!(Reliability::Low < Reliability::Medium);
        assert!(Reliability::Medium < Reliability::High);
    }

    #[test]
    fn test_describe_capabilities() {
        let native = CapabilityDescriptor::for_kind(BackendKind::NativePty);
        assert_eq!(
            describe_capabilities(&native),
            "native-pty (high reliability): resize, color, interactive, history"
        );

        let winpty = CapabilityDescriptor::for_kind(BackendKind::WindowsWinpty);
        assert_eq!(
            describe_capabilities(&winpty),
            "windows-winpty (medium reliability): color, interactive"
        );
    }

    #[test]
    fn test_describe_capabilities_without_features() {
        let plain = CapabilityDescriptor::for_kind(BackendKind::Subprocess);
        let text = describe_capabilities(&plain);
        assert_eq!(text, "subprocess (low reliability): none");
        assert!(!text.ends_with(", "));
    }

    #[test]
    fn test_detector_caches_until_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut detector = Detector::with_probe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            unix(true)
        });

        let first = detector.detect_best_backend();
        let second = detector.detect_best_backend();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        detector.refresh();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_real_probe_yields_known_kind() {
        let descriptor = Detector::new().detect_best_backend();
        assert!(matches!(
            descriptor.backend,
            BackendKind::NativePty
                | BackendKind::WindowsConpty
                | BackendKind::WindowsWinpty
                | BackendKind::Subprocess
        ));
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let json =
            serde_json::to_value(CapabilityDescriptor::for_kind(BackendKind::WindowsConpty))
                .unwrap();
        assert_eq!(json["backend"], "windows-conpty");
        assert_eq!(json["supportsResize"], true);
        assert_eq!(json["reliability"], "high");
    }
}
