//! Line-delimited message protocol between the front-end and the worker.
//!
//! Every line is one JSON object `{"type": ..., "data": ...}`. Newline is the
//! only delimiter; JSON string escaping keeps payload newlines out of the
//! encoded line. Readers skip anything that does not decode.

use crate::error::StreamError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

pub const STATUS_INITIALIZED: &str = "initialized";
pub const STATUS_THINKING: &str = "thinking";
pub const STATUS_TOOL_RESULT: &str = "tool_result";
pub const STATUS_NOTICE: &str = "notice";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Init,
    Chat,
    Response,
    Error,
    ToolCall,
    StreamChunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitPayload {
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_name: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamChunkPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Envelope {
    fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Self {
        let data = serde_json::to_value(payload)
            .ok()
            .filter(|value| !value.is_null());
        Self { kind, data }
    }

    pub fn init(api_key: &str) -> Self {
        Self::with_payload(
            MessageType::Init,
            &InitPayload {
                api_key: api_key.to_string(),
            },
        )
    }

    pub fn chat(message: &str) -> Self {
        Self::with_payload(
            MessageType::Chat,
            &ChatPayload {
                message: message.to_string(),
            },
        )
    }

    pub fn response(payload: ResponsePayload) -> Self {
        Self::with_payload(MessageType::Response, &payload)
    }

    /// Handshake completion sent by the worker after `init`.
    pub fn initialized(message: &str) -> Self {
        Self::response(ResponsePayload {
            status: Some(STATUS_INITIALIZED.to_string()),
            message: Some(message.to_string()),
            content: None,
        })
    }

    /// Final answer of a chat turn.
    pub fn answer(content: &str) -> Self {
        Self::response(ResponsePayload {
            status: None,
            message: None,
            content: Some(content.to_string()),
        })
    }

    /// Informational response with a status tag and no content.
    pub fn status(status: &str, message: &str) -> Self {
        Self::response(ResponsePayload {
            status: Some(status.to_string()),
            message: Some(message.to_string()),
            content: None,
        })
    }

    pub fn tool_call(tool_name: &str, args: Map<String, Value>) -> Self {
        Self::with_payload(
            MessageType::ToolCall,
            &ToolCallPayload {
                tool_name: tool_name.to_string(),
                args,
            },
        )
    }

    pub fn thinking() -> Self {
        Self::with_payload(
            MessageType::StreamChunk,
            &StreamChunkPayload {
                content: None,
                status: Some(STATUS_THINKING.to_string()),
            },
        )
    }

    pub fn chunk(content: &str) -> Self {
        Self::with_payload(
            MessageType::StreamChunk,
            &StreamChunkPayload {
                content: Some(content.to_string()),
                status: None,
            },
        )
    }

    pub fn error(message: &str, details: Option<&str>) -> Self {
        Self::with_payload(
            MessageType::Error,
            &ErrorPayload {
                message: message.to_string(),
                details: details.map(str::to_string),
            },
        )
    }

    /// Decode the payload, falling back to defaults for anything missing or
    /// mistyped.
    pub fn payload<T: DeserializeOwned + Default>(&self) -> T {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
            .unwrap_or_default()
    }

    /// Encode as a single line (no trailing newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line; `None` for blank, malformed or unknown-type lines.
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Pull-based reader: each call returns exactly one well-formed envelope.
pub struct EnvelopeReader<R> {
    inner: R,
    buf: Vec<u8>,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            skipped: 0,
        }
    }

    pub async fn next_envelope(&mut self) -> Result<Envelope, StreamError> {
        loop {
            self.buf.clear();
            let read = self.inner.read_until(b'\n', &mut self.buf).await?;
            if read == 0 {
                return Err(StreamError::Closed);
            }

            let line = String::from_utf8_lossy(&self.buf);
            match Envelope::decode(&line) {
                Some(envelope) => return Ok(envelope),
                None => {
                    if !line.trim().is_empty() {
                        self.skipped += 1;
                        debug!("Skipping non-envelope line: {}", line.trim_end());
                    }
                }
            }
        }
    }

    /// Number of non-blank lines that were not envelopes.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

pub struct EnvelopeWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        let mut line = envelope
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Outbound envelopes inside the worker; a single task owns stdout.
pub type EnvelopeSender = mpsc::UnboundedSender<Envelope>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn samples() -> Vec<Envelope> {
        let mut args = Map::new();
        args.insert("filePath".into(), json!("pkg/calc.go"));
        args.insert("coverageTarget".into(), json!(80));

        vec![
            Envelope::init("key-123"),
            Envelope::chat("write tests for\n\"calc.go\""),
            Envelope::initialized("ready"),
            Envelope::answer("line one\nline two"),
            Envelope::status(STATUS_NOTICE, "overwriting calc_test.go"),
            Envelope::tool_call("generate_unit_tests", args),
            Envelope::thinking(),
            Envelope::chunk("Hel"),
            Envelope::error("boom", Some("service")),
            Envelope::error("boom", None),
        ]
    }

    #[test]
    fn test_round_trip() {
        for envelope in samples() {
            let line = envelope.encode().unwrap();
            assert!(!line.contains('\n'), "encoded line has a newline: {line}");
            assert_eq!(Envelope::decode(&line), Some(envelope));
        }
    }

    #[test]
    fn test_wire_shape() {
        let line = Envelope::init("abc").encode().unwrap();
        assert_eq!(line, r#"{"type":"init","data":{"apiKey":"abc"}}"#);

        let line = Envelope::thinking().encode().unwrap();
        assert_eq!(line, r#"{"type":"stream_chunk","data":{"status":"thinking"}}"#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Envelope::decode(""), None);
        assert_eq!(Envelope::decode("   "), None);
        assert_eq!(Envelope::decode("> agent@1.0.0 start"), None);
        assert_eq!(Envelope::decode(r#"{"type":"telemetry"}"#), None);
        assert_eq!(Envelope::decode(r#"{"data":{}}"#), None);
    }

    #[test]
    fn test_missing_data_is_allowed() {
        let envelope = Envelope::decode(r#"{"type":"response"}"#).unwrap();
        assert_eq!(envelope.kind, MessageType::Response);
        let payload: ResponsePayload = envelope.payload();
        assert_eq!(payload, ResponsePayload::default());
    }

    #[test]
    fn test_payload_is_lenient() {
        let envelope = Envelope::decode(r#"{"type":"error","data":{"message":42}}"#).unwrap();
        let payload: ErrorPayload = envelope.payload();
        assert_eq!(payload.message, "");

        let envelope =
            Envelope::decode(r#"{"type":"tool_call","data":{"toolName":"read_file"}}"#).unwrap();
        let payload: ToolCallPayload = envelope.payload();
        assert_eq!(payload.tool_name, "read_file");
        assert!(payload.args.is_empty());
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_lines() {
        let input = b"not json at all\n\n{\"type\":\"chat\",\"data\":{\"message\":\"hi\"}}\n";
        let mut reader = EnvelopeReader::new(&input[..]);

        let envelope = reader.next_envelope().await.unwrap();
        assert_eq!(envelope, Envelope::chat("hi"));
        assert_eq!(reader.skipped(), 1);

        assert!(matches!(
            reader.next_envelope().await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reader_tolerates_invalid_utf8() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(Envelope::thinking().encode().unwrap().as_bytes());
        input.push(b'\n');
        let mut reader = EnvelopeReader::new(&input[..]);

        assert_eq!(reader.next_envelope().await.unwrap(), Envelope::thinking());
    }

    #[tokio::test]
    async fn test_reader_reports_closed_on_empty_stream() {
        let mut reader = EnvelopeReader::new(&b""[..]);
        assert!(matches!(
            reader.next_envelope().await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_envelope() {
        let mut writer = EnvelopeWriter::new(Vec::new());
        writer.send(&Envelope::chat("a\nb")).await.unwrap();
        writer.send(&Envelope::thinking()).await.unwrap();

        let written = String::from_utf8(writer.get_ref().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Envelope::decode(lines[0]), Some(Envelope::chat("a\nb")));
    }
}
