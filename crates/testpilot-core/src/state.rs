//! UI-agnostic conversation state
//!
//! Folds the envelopes coming back from the worker into a transcript. The
//! front-end owns one [`Conversation`] and renders it; nothing here depends on
//! a terminal or a process.

use crate::protocol::{
    Envelope, ErrorPayload, MessageType, ResponsePayload, StreamChunkPayload,
    ToolCallPayload, STATUS_INITIALIZED, STATUS_NOTICE, STATUS_THINKING,
};
use crate::tools::summarize_call;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const READY_MESSAGE: &str =
    "✓ Agent initialized successfully! You can now start by sending a message.";
pub const THINKING_MESSAGE: &str = "💭 Thinking...";

/// Who a transcript entry is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub is_error: bool,
}

impl TranscriptEntry {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Local::now(),
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(Role::System, content)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingCredential,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    phase: Phase,
    entries: Vec<TranscriptEntry>,
    is_processing: bool,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingCredential,
            entries: Vec::new(),
            is_processing: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    /// Accept a credential and mark the handshake as in progress.
    pub fn request_start(&mut self, api_key: &str) -> bool {
        if self.phase != Phase::AwaitingCredential || self.is_processing || api_key.trim().is_empty()
        {
            return false;
        }
        self.is_processing = true;
        true
    }

    /// The `chat` envelope to send, or `None` when sending is not allowed
    /// right now. Only one request may be in flight.
    pub fn submit(&mut self, text: &str) -> Option<Envelope> {
        let text = text.trim();
        if text.is_empty() || self.phase != Phase::Active || self.is_processing {
            return None;
        }

        self.entries.push(TranscriptEntry::new(Role::User, text));
        self.is_processing = true;
        Some(Envelope::chat(text))
    }

    pub fn apply(&mut self, envelope: &Envelope) {
        match envelope.kind {
            MessageType::Response => self.apply_response(envelope.payload()),
            MessageType::StreamChunk => {
                let chunk: StreamChunkPayload = envelope.payload();
                if chunk.status.as_deref() == Some(STATUS_THINKING) {
                    self.entries
                        .push(TranscriptEntry::new(Role::System, THINKING_MESSAGE));
                } else if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                    self.upsert_last_assistant(&content);
                }
            }
            MessageType::ToolCall => {
                let call: ToolCallPayload = envelope.payload();
                self.entries.push(TranscriptEntry::new(
                    Role::Tool,
                    summarize_call(&call.tool_name, &call.args),
                ));
            }
            MessageType::Error => {
                let error: ErrorPayload = envelope.payload();
                self.entries
                    .push(TranscriptEntry::error(format!("❌ Error: {}", error.message)));
                self.is_processing = false;
            }
            MessageType::Init | MessageType::Chat => {}
        }
    }

    fn apply_response(&mut self, response: ResponsePayload) {
        if response.status.as_deref() == Some(STATUS_INITIALIZED) {
            self.phase = Phase::Active;
            self.is_processing = false;
            self.entries
                .push(TranscriptEntry::new(Role::System, READY_MESSAGE));
            return;
        }

        if let Some(content) = response.content.filter(|c| !c.is_empty()) {
            let last_is_assistant = self
                .entries
                .last()
                .map(|e| e.role == Role::Assistant)
                .unwrap_or(false);
            if !last_is_assistant {
                self.entries
                    .push(TranscriptEntry::new(Role::Assistant, content));
            }
            // Identical or refined content was already delivered by streaming.
            self.is_processing = false;
            return;
        }

        if response.status.as_deref() == Some(STATUS_NOTICE) {
            if let Some(message) = response.message.filter(|m| !m.is_empty()) {
                self.entries
                    .push(TranscriptEntry::new(Role::System, format!("ℹ {}", message)));
            }
        }
    }

    /// Replace the content of a trailing assistant entry, or append one.
    pub fn upsert_last_assistant(&mut self, content: &str) {
        match self.entries.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = content.to_string();
            }
            _ => self
                .entries
                .push(TranscriptEntry::new(Role::Assistant, content)),
        }
    }

    /// Record a failure of the channel itself rather than of a request.
    pub fn fail(&mut self, message: &str) {
        self.entries
            .push(TranscriptEntry::error(format!("❌ System Error: {}", message)));
        self.is_processing = false;
    }
}
