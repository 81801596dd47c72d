//! AMI frame parsing and message classification

use crate::{
    buffer::AmiBuffer,
    command::AmiResponse,
    constants::*,
    error::{AmiError, AmiResult},
    event::AmiEvent,
};
use indexmap::IndexMap;

/// AMI message types
#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    /// Asynchronous event (`Event:` header)
    Event,
    /// Reply to an action (`Response:` header)
    Response,
    /// Neither; logged and ignored
    Other,
}

/// One parsed frame
#[derive(Debug, Clone)]
pub struct AmiMessage {
    pub message_type: MessageType,
    pub headers: IndexMap<String, String>,
}

impl AmiMessage {
    pub fn new(headers: IndexMap<String, String>) -> Self {
        let message_type = if headers.contains_key(HEADER_EVENT) {
            MessageType::Event
        } else if headers.contains_key(HEADER_RESPONSE) {
            MessageType::Response
        } else {
            MessageType::Other
        };
        Self {
            message_type,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn into_response(self) -> AmiResponse {
        AmiResponse::new(self.headers)
    }

    pub fn into_event(self) -> AmiResult<AmiEvent> {
        if self.message_type != MessageType::Event {
            return Err(AmiError::protocol_error("Message is not an event"));
        }
        Ok(AmiEvent::from_headers(self.headers))
    }
}

/// Split a frame into `Key: Value` pairs.
///
/// Splits on the first colon and trims both sides. Lines without a colon are
/// ignored, and the last occurrence of a repeated key wins.
pub fn parse_headers(frame: &str) -> IndexMap<String, String> {
    let mut headers = IndexMap::new();

    for line in frame.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            headers.insert(key.to_string(), value.trim().to_string());
        }
    }

    headers
}

/// Incremental frame parser over the receive buffer
pub struct AmiParser {
    buffer: AmiBuffer,
}

impl AmiParser {
    pub fn new() -> Self {
        Self {
            buffer: AmiBuffer::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer.extend_from_slice(data);
        self.buffer.check_size_limits()
    }

    /// Take the greeting line (`Asterisk Call Manager/5.0.1`), if complete.
    pub fn read_banner(&mut self) -> Option<String> {
        let line = self.buffer.extract_until_pattern(b"\n")?;
        self.buffer.compact();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches('\r')
                .to_string(),
        )
    }

    /// Try to parse the next complete frame from the buffer.
    ///
    /// Blank frames (stray delimiters) are skipped.
    pub fn next_message(&mut self) -> Option<AmiMessage> {
        loop {
            let frame = self.buffer.extract_frame()?;
            self.buffer.compact();

            let text = String::from_utf8_lossy(&frame);
            let headers = parse_headers(&text);
            if headers.is_empty() {
                tracing::trace!("[RECV] Skipping frame without headers");
                continue;
            }
            return Some(AmiMessage::new(headers));
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered bytes, used when a connection is torn down
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(
            "Event: Cdr\r\nUniqueID: 1700000000.1\r\nStartTime: 2024-01-15 10:30:00\r\nno colon here",
        );

        assert_eq!(headers.get("Event").map(String::as_str), Some("Cdr"));
        assert_eq!(
            headers.get("UniqueID").map(String::as_str),
            Some("1700000000.1")
        );
        // Only the first colon splits
        assert_eq!(
            headers.get("StartTime").map(String::as_str),
            Some("2024-01-15 10:30:00")
        );
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_parse_headers_last_wins() {
        let headers = parse_headers("Event: Hold\nChannel: PJSIP/1-1\nChannel: PJSIP/2-2");
        assert_eq!(
            headers.get("Channel").map(String::as_str),
            Some("PJSIP/2-2")
        );
    }

    #[test]
    fn test_banner_then_response() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Asterisk Call Manager/5.0.1\r\nResponse: Success\r\nMessage: Authentication accepted\r\n\r\n")
            .unwrap();

        assert_eq!(
            parser.read_banner().as_deref(),
            Some("Asterisk Call Manager/5.0.1")
        );
        let message = parser.next_message().unwrap();
        assert_eq!(message.message_type, MessageType::Response);
        assert!(message.into_response().is_success());
        assert_eq!(parser.buffer_len(), 0);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut parser = AmiParser::new();
        parser.add_data(b"Event: Hold\r\nUniq").unwrap();
        assert!(parser.next_message().is_none());

        parser
            .add_data(b"ueid: 1.1\r\n\r\nEvent: Unhold\r\nUniqueid: 1.1\r\n\r\nEvent: Cdr")
            .unwrap();

        let hold = parser.next_message().unwrap().into_event().unwrap();
        assert_eq!(hold.call_id(), Some("1.1"));
        let unhold = parser.next_message().unwrap();
        assert_eq!(unhold.header("Event"), Some("Unhold"));
        assert!(parser.next_message().is_none());
        assert_eq!(parser.buffer_len(), "Event: Cdr".len());
    }

    #[test]
    fn test_blank_frames_skipped() {
        let mut parser = AmiParser::new();
        parser.add_data(b"\r\n\r\nEvent: Hold\r\n\r\n").unwrap();
        let message = parser.next_message().unwrap();
        assert_eq!(message.message_type, MessageType::Event);
    }

    #[test]
    fn test_response_is_not_event() {
        let message = AmiMessage::new(parse_headers("Response: Success\r\nPing: Pong"));
        assert_eq!(message.message_type, MessageType::Response);
        assert!(message.into_event().is_err());
    }
}
