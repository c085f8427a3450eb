//! Wire message model and payload codec
//!
//! Every frame on the wire is a 4-byte big-endian length followed by a
//! UTF-8 payload of exactly that many bytes. The payload itself is
//! `sender_id CRLF cmd CRLF args`, where the arguments are joined with
//! `%`. An empty args field means zero arguments. There is no escaping:
//! arguments must not contain `%` or CRLF, and the sender is responsible
//! for that.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Separator between arguments in the payload.
const ARG_DELIMITER: char = '%';

static PAYLOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)\r\n(.+)\r\n(.*)$").expect("payload regex"));

/// A single request or response exchanged between coordinator and worker.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender_id: String,
    cmd: String,
    args: Vec<String>,
}

impl Message {
    /// Creates a message with arguments.
    pub fn new(
        sender_id: impl Into<String>,
        cmd: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            cmd: cmd.into(),
            args,
        }
    }

    /// Creates a message with no arguments.
    pub fn without_args(sender_id: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self::new(sender_id, cmd, Vec::new())
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Serializes the payload (without the length prefix).
    pub fn encode(&self) -> String {
        format!(
            "{}\r\n{}\r\n{}",
            self.sender_id,
            self.cmd,
            self.args.join(&ARG_DELIMITER.to_string())
        )
    }

    /// Serializes the full wire frame: 4-byte big-endian length, then payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.encode();
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload.as_bytes());
        frame
    }

    /// Parses a payload received off the wire.
    ///
    /// A payload that does not match the expected shape is a protocol error
    /// and the caller must close the connection.
    pub fn parse(payload: &str) -> Result<Self> {
        let caps = PAYLOAD_RE
            .captures(payload)
            .ok_or_else(|| Error::Protocol(format!("unparsable payload: {:?}", payload)))?;

        let sender_id = caps[1].to_string();
        let cmd = caps[2].to_string();
        let args_field = &caps[3];

        let args = if args_field.is_empty() {
            Vec::new()
        } else {
            args_field
                .split(ARG_DELIMITER)
                .map(str::to_string)
                .collect()
        };

        Ok(Self {
            sender_id,
            cmd,
            args,
        })
    }

    /// Parses a payload from raw frame bytes.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Protocol(format!("payload is not UTF-8: {}", e)))?;
        Self::parse(text)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<{} {} [{}]>",
            self.sender_id,
            self.cmd,
            self.args.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_execute() {
        let msg = Message::new(
            "Coordinator",
            "execute",
            vec![
                "c1".to_string(),
                "/tmp".to_string(),
                "NULL".to_string(),
                "python".to_string(),
                "train.py".to_string(),
            ],
        );
        let payload = msg.encode();
        assert_eq!(
            payload,
            "Coordinator\r\nexecute\r\nc1%/tmp%NULL%python%train.py"
        );

        let frame = msg.to_frame();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, payload.len());
        assert_eq!(&frame[4..], payload.as_bytes());
    }

    #[test]
    fn test_decode_empty_args() {
        let msg = Message::parse("W1\r\npong\r\n").expect("parse");
        assert_eq!(msg.sender_id(), "W1");
        assert_eq!(msg.cmd(), "pong");
        assert!(msg.args().is_empty());

        // Re-encoding produces the same bytes.
        assert_eq!(msg.encode(), "W1\r\npong\r\n");
    }

    #[test]
    fn test_round_trip_with_args() {
        let msg = Message::new(
            "W1",
            "done",
            vec!["c1".to_string(), "0.125".to_string()],
        );
        let decoded = Message::parse(&msg.encode()).expect("parse");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Message::parse("no-crlf-at-all").is_err());
        assert!(Message::parse("only-one\r\nfield").is_err());
        assert!(Message::parse("").is_err());
    }

    #[test]
    fn test_from_bytes_rejects_invalid_utf8() {
        assert!(Message::from_bytes(&[0xff, 0xfe, 0x0d, 0x0a]).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            sender in "[A-Za-z0-9_-]{1,16}",
            cmd in "[a-z_]{1,20}",
            args in proptest::collection::vec("[^%\r\n]{1,12}", 0..6),
        ) {
            let msg = Message::new(sender, cmd, args);
            let decoded = Message::parse(&msg.encode()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
