//! AWS eventstream binary framing.
//!
//! Frame layout: total length (u32), headers length (u32), prelude CRC,
//! headers, payload, message CRC. CRCs are not verified; the transport below
//! already guarantees integrity.

use std::collections::BTreeMap;

use crate::{ExtProcError, Result};

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventStreamMessage {
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl EventStreamMessage {
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(":message-type").map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get(":event-type").map(String::as_str)
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.headers.get(":exception-type").map(String::as_str)
    }
}

/// Accumulates bytes and yields complete frames; a partial frame stays
/// buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self) -> Result<Option<EventStreamMessage>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = read_u32(&self.buffer[0..4]) as usize;
        if total_len < MIN_FRAME_LEN {
            return Err(ExtProcError::Translation(
                "eventstream total_len too small".to_string(),
            ));
        }
        if total_len > MAX_FRAME_LEN {
            return Err(ExtProcError::Translation(format!(
                "eventstream frame exceeds {MAX_FRAME_LEN} bytes"
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }
        let message = self.buffer.drain(0..total_len).collect::<Vec<u8>>();
        let headers_len = read_u32(&message[4..8]) as usize;
        let headers_end = PRELUDE_LEN.saturating_add(headers_len);
        let payload_end = total_len - 4;
        if headers_end > payload_end {
            return Err(ExtProcError::Translation(
                "eventstream invalid headers length".to_string(),
            ));
        }

        let headers = parse_headers(&message[PRELUDE_LEN..headers_end])?;
        let payload = message[headers_end..payload_end].to_vec();
        Ok(Some(EventStreamMessage { headers, payload }))
    }

    /// Drains every complete frame currently buffered.
    pub fn drain_messages(&mut self) -> Result<Vec<EventStreamMessage>> {
        let mut out = Vec::new();
        while let Some(message) = self.next_message()? {
            out.push(message);
        }
        Ok(out)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Only string-typed (7) header values are kept; other types are skipped.
fn parse_headers(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut idx = 0usize;
    let ensure_len = |idx: usize, needed: usize, label: &str| -> Result<()> {
        if idx + needed > bytes.len() {
            return Err(ExtProcError::Translation(format!(
                "eventstream header truncated ({label})"
            )));
        }
        Ok(())
    };

    while idx < bytes.len() {
        let name_len = usize::from(bytes[idx]);
        idx += 1;
        ensure_len(idx, name_len, "name")?;
        let name = std::str::from_utf8(&bytes[idx..idx + name_len]).map_err(|err| {
            ExtProcError::Translation(format!("eventstream bad header name: {err}"))
        })?;
        idx += name_len;
        ensure_len(idx, 1, "type")?;
        let value_type = bytes[idx];
        idx += 1;

        match value_type {
            0 | 1 => {}
            2 => {
                ensure_len(idx, 1, "byte")?;
                idx += 1;
            }
            3 => {
                ensure_len(idx, 2, "short")?;
                idx += 2;
            }
            4 => {
                ensure_len(idx, 4, "int")?;
                idx += 4;
            }
            5 | 8 => {
                ensure_len(idx, 8, "long")?;
                idx += 8;
            }
            6 | 7 => {
                ensure_len(idx, 2, "length")?;
                let len = usize::from(u16::from_be_bytes([bytes[idx], bytes[idx + 1]]));
                idx += 2;
                ensure_len(idx, len, "bytes")?;
                if value_type == 7 {
                    let value = std::str::from_utf8(&bytes[idx..idx + len]).map_err(|err| {
                        ExtProcError::Translation(format!(
                            "eventstream header value utf8 error: {err}"
                        ))
                    })?;
                    out.insert(name.to_string(), value.to_string());
                }
                idx += len;
            }
            9 => {
                ensure_len(idx, 16, "uuid")?;
                idx += 16;
            }
            other => {
                return Err(ExtProcError::Translation(format!(
                    "eventstream unsupported header type {other}"
                )));
            }
        }
    }
    Ok(out)
}
