//! Wire contracts between the broker and editor processes.
//!
//! Every message is a single JSON object terminated by `\n`. Editors send
//! registration, unsolicited state pushes and replies; the broker sends
//! acknowledgments and id-tagged requests.

use crate::state::{deserialize_flag, EditorState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Messages an editor sends without being asked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorEvent {
    Register {
        instance_id: String,
        #[serde(default)]
        info: InstanceInfo,
    },
    StateUpdate {
        #[serde(default)]
        state: EditorState,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceInfo {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub main_file: Option<String>,
    #[serde(default)]
    pub buffers: Vec<Value>,
}

/// Reply to a broker-issued request, matched by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFault {
    #[serde(default)]
    pub message: String,
}

impl ReplyFrame {
    pub fn into_result(self) -> Result<Value, RemoteFault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Anything an editor may put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Inbound {
    Event(EditorEvent),
    Reply(ReplyFrame),
}

/// Anything the broker may put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Ack(BrokerEvent),
    Request(RequestFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    Registered { instance_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub call: EditorCall,
}

/// Methods the editor plugin understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum EditorCall {
    GetState {},
    ExecuteCommand {
        command: String,
    },
    SearchHelp {
        query: String,
    },
    RecordMacro {
        macro_sequence: String,
        register: String,
        execute: bool,
    },
}

impl EditorCall {
    pub fn get_state() -> Self {
        EditorCall::GetState {}
    }

    pub fn execute(command: impl Into<String>) -> Self {
        EditorCall::ExecuteCommand {
            command: command.into(),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            EditorCall::GetState {} => "get_state",
            EditorCall::ExecuteCommand { .. } => "execute_command",
            EditorCall::SearchHelp { .. } => "search_help",
            EditorCall::RecordMacro { .. } => "record_macro",
        }
    }
}

/// `result` body of a `search_help` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HelpReply {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub success: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<Value>,
}

/// `result` body of a `record_macro` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MacroReply {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("connection closed with {size} bytes of unterminated frame")]
    Unterminated { size: usize },
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(mut raw: &[u8]) -> &[u8] {
    if let Some(stripped) = raw.strip_suffix(b"\n") {
        raw = stripped;
    }
    if let Some(stripped) = raw.strip_suffix(b"\r") {
        raw = stripped;
    }
    raw
}

/// Incremental newline-delimited JSON decoder for one connection.
///
/// Bytes are fed in arrival order. Only complete lines are decoded; the
/// trailing fragment waits for the next chunk. A line that fails to decode is
/// reported and skipped without disturbing the lines after it.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    discarding: bool,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            discarding: false,
            marker: PhantomData,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if self.discarding {
                // tail of a line already reported as oversized
                self.discarding = false;
                continue;
            }
            self.decode_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.discarding = true;
        }

        report
    }

    /// Drops whatever is buffered once the peer has closed its side. A line
    /// without its newline is never decoded; a non-blank leftover is reported.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let discarding = std::mem::replace(&mut self.discarding, false);
        if !discarding && !rest.iter().all(u8::is_ascii_whitespace) {
            report
                .errors
                .push(FrameError::Unterminated { size: rest.len() });
        }
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        let frame = trim_line_ending(line);
        if frame.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}
