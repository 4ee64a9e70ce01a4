//! Duplicate and resize-echo loop suppression for session output.
//!
//! Some backend and emulator combinations feed resize acknowledgements back
//! into the shell, which answers with another short escape sequence and a
//! prompt, forever. [`EchoGuard`] drops such output. It is a per-session
//! heuristic: a legitimately repeated short line can be dropped too.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Deserialize;

pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 100;
pub const DEFAULT_MAX_REPEATS: u32 = 3;
pub const DEFAULT_ECHO_MAX_LEN: usize = 64;
pub const DEFAULT_LOOP_WINDOW_MS: u64 = 1000;
pub const DEFAULT_LOOP_THRESHOLD: usize = 5;
pub const DEFAULT_RESET_LEN: usize = 256;

const ESC: char = '\x1b';

/// Sequences a terminal emits while acknowledging a resize.
const ECHO_MARKERS: [&str; 5] = [
    "\x1b[8;",     // window size report
    "\x1b[?2004h", // bracketed paste re-enabled by a redrawn prompt
    "\x1b[K",      // erase to end of line
    "\x1b]0;",     // window title
    "\x1b]2;",
];

const PROMPT_ENDINGS: [char; 4] = ['$', '#', '%', '>'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    /// Identical chunks closer together than this count as repeats.
    pub dedup_window_ms: u64,
    /// Repeat count at which identical chunks start being dropped.
    pub max_repeats: u32,
    /// Longest chunk still considered a possible echo.
    pub echo_max_len: usize,
    pub loop_window_ms: u64,
    /// Echo candidates tolerated inside one loop window.
    pub loop_threshold: usize,
    /// Plain output at least this long resets all suppression state.
    pub reset_len: usize,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            max_repeats: DEFAULT_MAX_REPEATS,
            echo_max_len: DEFAULT_ECHO_MAX_LEN,
            loop_window_ms: DEFAULT_LOOP_WINDOW_MS,
            loop_threshold: DEFAULT_LOOP_THRESHOLD,
            reset_len: DEFAULT_RESET_LEN,
        }
    }
}

impl SuppressionConfig {
    fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    fn loop_window(&self) -> Duration {
        Duration::from_millis(self.loop_window_ms)
    }
}

/// What to do with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    /// Dropped as a rapid identical repeat.
    Duplicate,
    /// Dropped as part of a resize-echo loop.
    Loop,
}

#[derive(Debug, Clone)]
pub struct EchoGuard {
    config: SuppressionConfig,
    last_chunk: Option<String>,
    last_seen: Option<Instant>,
    repeats: u32,
    candidates: VecDeque<Instant>,
    tripped: bool,
}

impl EchoGuard {
    pub fn new(config: SuppressionConfig) -> Self {
        Self {
            config,
            last_chunk: None,
            last_seen: None,
            repeats: 0,
            candidates: VecDeque::new(),
            tripped: false,
        }
    }

    /// Classify `chunk`, received at `now`, and update the state.
    pub fn check(&mut self, chunk: &str, now: Instant) -> Verdict {
        let previous = self.last_seen.replace(now);

        if self.is_reset_payload(chunk) {
            self.reset();
            self.last_chunk = Some(chunk.to_string());
            return Verdict::Forward;
        }

        let gap = previous.map(|at| now.saturating_duration_since(at));
        if self.tripped && gap.is_some_and(|gap| gap > self.config.loop_window()) {
            log::debug!("echo loop guard released after quiet period");
            self.tripped = false;
            self.candidates.clear();
        }

        let repeated = self.last_chunk.as_deref() == Some(chunk)
            && gap.is_some_and(|gap| gap <= self.config.dedup_window());
        self.repeats = if repeated {
            self.repeats.saturating_add(1)
        } else {
            0
        };
        if !repeated {
            self.last_chunk = Some(chunk.to_string());
        }
        if self.repeats >= self.config.max_repeats {
            return Verdict::Duplicate;
        }

        if !self.is_echo_candidate(chunk) {
            return Verdict::Forward;
        }
        if self.tripped {
            return Verdict::Loop;
        }
        let window = self.config.loop_window();
        self.candidates.push_back(now);
        while let Some(&oldest) = self.candidates.front() {
            if now.saturating_duration_since(oldest) > window {
                self.candidates.pop_front();
            } else {
                break;
            }
        }
        if self.candidates.len() > self.config.loop_threshold {
            log::warn!(
                "resize echo loop detected ({} candidates within {}ms); suppressing",
                self.candidates.len(),
                self.config.loop_window_ms
            );
            self.tripped = true;
            self.candidates.clear();
            return Verdict::Loop;
        }
        Verdict::Forward
    }

    #[cfg(test)]
    fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn reset(&mut self) {
        self.last_chunk = None;
        self.repeats = 0;
        self.candidates.clear();
        self.tripped = false;
    }

    fn is_reset_payload(&self, chunk: &str) -> bool {
        chunk.len() >= self.config.reset_len && !chunk.starts_with(ESC)
    }

    fn is_echo_candidate(&self, chunk: &str) -> bool {
        if chunk.len() > self.config.echo_max_len || !chunk.contains(ESC) {
            return false;
        }
        ECHO_MARKERS.iter().any(|marker| chunk.contains(marker))
            || chunk.trim_end().ends_with(PROMPT_ENDINGS)
    }
}
