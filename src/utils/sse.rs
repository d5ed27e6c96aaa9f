use crate::{ExtProcError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental server-sent-events parser.
///
/// Bytes are pushed as they arrive; only complete events are returned and any
/// trailing partial line stays buffered for the next push.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: Vec<u8>,
    data: String,
    limits: SseLimits,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SseLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut consumed = 0usize;
        while let Some(pos) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let line = std::str::from_utf8(&self.pending[consumed..end])
                .map_err(|err| ExtProcError::Translation(format!("invalid SSE UTF-8: {err}")))?
                .trim_end_matches('\r')
                .to_string();
            consumed = end + 1;
            self.handle_line(&line, &mut events)?;
        }
        self.pending.drain(..consumed);
        if self.pending.len() > self.limits.max_line_bytes {
            return Err(ExtProcError::Translation(format!(
                "SSE line exceeds max_line_bytes={}",
                self.limits.max_line_bytes
            )));
        }
        Ok(events)
    }

    /// Flushes a trailing line and any event not closed by a blank line.
    pub fn finish(&mut self) -> Result<Vec<SseEvent>> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            let line = String::from_utf8(pending)
                .map_err(|err| ExtProcError::Translation(format!("invalid SSE UTF-8: {err}")))?;
            self.handle_line(line.trim_end_matches('\r'), &mut events)?;
        }
        self.dispatch(&mut events);
        Ok(events)
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<SseEvent>) -> Result<()> {
        if line.is_empty() {
            self.dispatch(events);
            return Ok(());
        }
        // Other fields (event, id, retry) and comments carry nothing we use.
        let Some(rest) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        let separator_bytes = usize::from(!self.data.is_empty());
        if self
            .data
            .len()
            .saturating_add(separator_bytes)
            .saturating_add(rest.len())
            > self.limits.max_event_bytes
        {
            return Err(ExtProcError::Translation(format!(
                "SSE event exceeds max_event_bytes={}",
                self.limits.max_event_bytes
            )));
        }
        if separator_bytes == 1 {
            self.data.push('\n');
        }
        self.data.push_str(rest);
        Ok(())
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data);
        if data.trim() == "[DONE]" {
            events.push(SseEvent::Done);
        } else {
            events.push(SseEvent::Data(data));
        }
    }
}
