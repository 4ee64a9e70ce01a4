//! Dedicated I/O threads that turn blocking backend reads into session events.
//!
//! Each reader gets its own OS thread because backend reads block. A waiter
//! thread blocks on process exit, gives the readers a short grace period to
//! drain, then reports `Exit`, so a session's data always precedes its exit.

use std::io::Read;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::backend::{BackendIo, ExitInfo, PtyError};

/// How long the waiter lets readers drain after the process exits. ConPTY
/// readers in particular may never see EOF.
const READER_GRACE: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 65536;

/// Identifies one incarnation of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    Data(String),
    Exit(ExitInfo),
    Error(String),
}

/// Event emitted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub tag: SessionTag,
    pub kind: SessionEventKind,
}

/// Start reader threads and the exit waiter for a session.
pub fn start_io_threads(
    tag: SessionTag,
    io: BackendIo,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), PtyError> {
    let (done_tx, done_rx) = std_mpsc::channel::<()>();
    let reader_count = io.readers.len();

    for (index, reader) in io.readers.into_iter().enumerate() {
        let tag = tag.clone();
        let events = events.clone();
        let done = done_tx.clone();
        std::thread::Builder::new()
            .name(format!("pty-io-{}-{index}", tag.id))
            .spawn(move || {
                read_loop(&tag, reader, &events);
                let _ = done.send(());
            })?;
    }
    drop(done_tx);

    let waiter = io.waiter;
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", tag.id))
        .spawn(move || {
            let exit = waiter();
            let deadline = Instant::now() + READER_GRACE;
            for _ in 0..reader_count {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if done_rx.recv_timeout(remaining).is_err() {
                    log::debug!("session {}: reader still open after exit", tag.id);
                    break;
                }
            }
            let _ = events.send(SessionEvent {
                tag,
                kind: SessionEventKind::Exit(exit),
            });
        })?;

    Ok(())
}

fn read_loop(
    tag: &SessionTag,
    mut reader: Box<dyn Read + Send>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how a Unix pty master reports that the child is gone.
                if e.raw_os_error() != Some(5) {
                    let _ = events.send(SessionEvent {
                        tag: tag.clone(),
                        kind: SessionEventKind::Error(format!("read failed: {e}")),
                    });
                }
                break;
            }
        };

        let text = decoder.decode(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        let sent = events.send(SessionEvent {
            tag: tag.clone(),
            kind: SessionEventKind::Data(text),
        });
        if sent.is_err() {
            return; // host gone
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(SessionEvent {
            tag: tag.clone(),
            kind: SessionEventKind::Data(rest),
        });
    }
}

/// Streaming UTF-8 decoder. Holds back an incomplete trailing sequence until
/// the next read completes it; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut input = self.pending.as_slice();

        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = input.split_at(err.valid_up_to());
                    // `valid_up_to` marks the end of valid UTF-8.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &after[len..];
                        }
                        None => {
                            input = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = input.to_vec();
        out
    }

    /// Flush whatever is left as replacement characters.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
