//! Incremental SSE parsing over arbitrary byte chunks.
//!
//! reqwest hands back chunks that split anywhere, including inside a UTF-8
//! sequence or between `event:` and `data:` lines; the parser buffers until
//! a blank line terminates a frame.

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, or "message" when absent (per the SSE spec).
    pub event: String,
    /// Concatenated `data:` lines, newline-joined.
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        // A frame ends at a blank line: \n\n (or \r\n\r\n).
        loop {
            let Some(end) = find_frame_end(&self.buffer) else {
                break;
            };
            let frame: Vec<u8> = self.buffer.drain(..end.1).collect();
            let text = String::from_utf8_lossy(&frame[..end.0]);

            let mut event_name = String::new();
            let mut data_lines: Vec<&str> = Vec::new();
            for line in text.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event_name = value.trim_start().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data_lines.push(value.strip_prefix(' ').unwrap_or(value));
                }
                // Comments (`:`) and other fields (`id:`, `retry:`) are
                // ignored.
            }

            if event_name.is_empty() && data_lines.is_empty() {
                continue; // keep-alive frame
            }
            events.push(SseEvent {
                event: if event_name.is_empty() {
                    "message".to_string()
                } else {
                    event_name
                },
                data: data_lines.join("\n"),
            });
        }

        events
    }
}

/// Find the first frame terminator. Returns (frame content length,
/// drain length including the terminator).
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i + 1, i + 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i + 2, i + 4));
        }
    }
    None
}
