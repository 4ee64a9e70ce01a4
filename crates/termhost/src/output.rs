use std::collections::VecDeque;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Per-session FIFO of output waiting to be forwarded in bounded chunks.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    segments: VecDeque<String>,
    len: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: String) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Remove up to `max` bytes from the front, cut on a character boundary.
    ///
    /// A single character wider than `max` is still taken whole so the
    /// buffer always makes progress.
    pub fn take_chunk(&mut self, max: usize) -> Option<String> {
        let mut chunk = String::new();
        while let Some(front) = self.segments.front_mut() {
            let room = max.saturating_sub(chunk.len());
            if front.len() <= room {
                chunk.push_str(front);
                self.segments.pop_front();
                continue;
            }
            let mut cut = floor_char_boundary(front, room);
            if cut == 0 {
                if !chunk.is_empty() {
                    break;
                }
                cut = front.chars().next().map_or(front.len(), char::len_utf8);
            }
            chunk.push_str(&front[..cut]);
            front.replace_range(..cut, "");
            break;
        }
        self.len -= chunk.len();
        (!chunk.is_empty()).then_some(chunk)
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
