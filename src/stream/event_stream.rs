//! AWS event-stream binary framing. Each message is a 12-byte prelude
//! (total length, headers length, prelude CRC), a header block, a payload,
//! and a trailing message CRC. CRCs are parsed but not verified, matching
//! the upstream parser this replaces.

use bytes::{Buf, BytesMut};
use std::collections::HashMap;

const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;
/// Defensive ceiling; a frame this large means we lost sync.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event_type: String,
    pub message_type: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

impl EventFrame {
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

#[derive(Debug, PartialEq)]
pub enum DecodeError {
    FrameTooLarge(usize),
    Malformed(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::FrameTooLarge(len) => write!(f, "event-stream frame of {} bytes", len),
            DecodeError::Malformed(what) => write!(f, "malformed event-stream frame: {}", what),
        }
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<EventFrame>, DecodeError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if total_len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(total_len));
        }
        if total_len < PRELUDE_LEN + MESSAGE_CRC_LEN {
            return Err(DecodeError::Malformed("total length below minimum"));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        if PRELUDE_LEN + headers_len + MESSAGE_CRC_LEN > total_len {
            return Err(DecodeError::Malformed("headers exceed frame"));
        }

        let mut frame = self.buffer.split_to(total_len);
        frame.advance(PRELUDE_LEN); // prelude incl. its CRC

        let headers_block = frame.split_to(headers_len);
        let headers = parse_headers(&headers_block)?;

        let payload_len = total_len - PRELUDE_LEN - headers_len - MESSAGE_CRC_LEN;
        let payload = frame.split_to(payload_len).to_vec();
        // Remaining 4 bytes are the message CRC, intentionally unchecked.

        Ok(Some(EventFrame {
            event_type: headers.get(":event-type").cloned().unwrap_or_default(),
            message_type: headers.get(":message-type").cloned().unwrap_or_default(),
            content_type: headers.get(":content-type").cloned().unwrap_or_default(),
            payload,
        }))
    }
}

fn parse_headers(block: &[u8]) -> Result<HashMap<String, String>, DecodeError> {
    let mut headers = HashMap::new();
    let mut cursor = 0usize;
    while cursor < block.len() {
        let name_len = block[cursor] as usize;
        cursor += 1;
        if cursor + name_len > block.len() {
            return Err(DecodeError::Malformed("header name overrun"));
        }
        let name = String::from_utf8_lossy(&block[cursor..cursor + name_len]).to_string();
        cursor += name_len;

        if cursor >= block.len() {
            return Err(DecodeError::Malformed("missing header value type"));
        }
        let value_type = block[cursor];
        cursor += 1;

        // Only string headers (type 7) appear on this upstream.
        if value_type != 7 {
            return Err(DecodeError::Malformed("unsupported header value type"));
        }
        if cursor + 2 > block.len() {
            return Err(DecodeError::Malformed("missing header value length"));
        }
        let value_len = u16::from_be_bytes([block[cursor], block[cursor + 1]]) as usize;
        cursor += 2;
        if cursor + value_len > block.len() {
            return Err(DecodeError::Malformed("header value overrun"));
        }
        let value = String::from_utf8_lossy(&block[cursor..cursor + value_len]).to_string();
        cursor += value_len;

        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
pub fn build_frame(event_type: &str, payload: &serde_json::Value) -> Vec<u8> {
    fn string_header(name: &[u8], value: &[u8]) -> Vec<u8> {
        let mut header = vec![name.len() as u8];
        header.extend_from_slice(name);
        header.push(7);
        header.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header.extend_from_slice(value);
        header
    }

    let payload_bytes = payload.to_string().into_bytes();
    let mut headers = Vec::new();
    headers.extend(string_header(b":event-type", event_type.as_bytes()));
    headers.extend(string_header(b":content-type", b"application/json"));
    headers.extend(string_header(b":message-type", b"event"));

    let total_len = PRELUDE_LEN + headers.len() + payload_bytes.len() + MESSAGE_CRC_LEN;
    let mut message = Vec::with_capacity(total_len);
    message.extend_from_slice(&(total_len as u32).to_be_bytes());
    message.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    message.extend_from_slice(&0u32.to_be_bytes()); // prelude CRC
    message.extend_from_slice(&headers);
    message.extend_from_slice(&payload_bytes);
    message.extend_from_slice(&0u32.to_be_bytes()); // message CRC
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_a_single_frame() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&build_frame(
            "initial-response",
            &json!({"conversationId": "conv-1"}),
        ));
        let frame = decoder.next_frame().unwrap().expect("frame");
        assert_eq!(frame.event_type, "initial-response");
        assert_eq!(frame.message_type, "event");
        assert_eq!(frame.content_type, "application/json");
        assert_eq!(frame.payload_json().unwrap()["conversationId"], "conv-1");
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn reassembles_frames_split_at_arbitrary_points() {
        let mut wire = Vec::new();
        wire.extend(build_frame("initial-response", &json!({"conversationId": "c"})));
        for content in ["foo", "bar", "baz"] {
            wire.extend(build_frame(
                "assistantResponseEvent",
                &json!({"content": content}),
            ));
        }

        for chunk_size in [1, 3, 7, 64, wire.len()] {
            let mut decoder = EventStreamDecoder::new();
            let mut frames = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 4, "chunk_size={}", chunk_size);
            let texts: Vec<String> = frames[1..]
                .iter()
                .map(|f| {
                    f.payload_json().unwrap()["content"]
                        .as_str()
                        .unwrap()
                        .to_string()
                })
                .collect();
            assert_eq!(texts, vec!["foo", "bar", "baz"]);
        }
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut decoder = EventStreamDecoder::new();
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&(u32::MAX).to_be_bytes());
        bogus.extend_from_slice(&[0u8; 8]);
        decoder.push(&bogus);
        assert!(matches!(
            decoder.next_frame(),
            Err(DecodeError::FrameTooLarge(_))
        ));
    }
}
