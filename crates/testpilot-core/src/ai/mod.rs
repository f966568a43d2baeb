//! Generative backends.
//!
//! The worker needs two shapes of model access: a multi-turn chat with
//! function calling for the agent loop, and plain prompt-in/text-out for test
//! generation. Both are traits so the loops can run against fakes.

pub mod gemini;

pub use gemini::GeminiClient;

use crate::error::ServiceError;
use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Call(FunctionCall),
    Result { name: String, response: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub speaker: Speaker,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(text: &str) -> Self {
        Self {
            speaker: Speaker::User,
            parts: vec![Part::Text(text.to_string())],
        }
    }

    pub fn model(reply: ModelReply) -> Self {
        Self {
            speaker: Speaker::Model,
            parts: reply.into_parts(),
        }
    }

    /// Function results go back to the model as a user turn.
    pub fn results(parts: Vec<Part>) -> Self {
        Self {
            speaker: Speaker::User,
            parts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub calls: Vec<FunctionCall>,
}

impl ModelReply {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: Vec::new(),
        }
    }

    pub fn into_parts(self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.calls.len() + 1);
        if !self.text.is_empty() {
            parts.push(Part::Text(self.text));
        }
        parts.extend(self.calls.into_iter().map(Part::Call));
        parts
    }
}

/// A function the model may call, with its JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        functions: &[FunctionDeclaration],
    ) -> Result<ModelReply, ServiceError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_parts_keep_text_before_calls() {
        let reply = ModelReply {
            text: "Reading it now".to_string(),
            calls: vec![FunctionCall {
                name: "read_file".to_string(),
                args: json!({"filePath": "main.go"}).as_object().cloned().unwrap(),
            }],
        };
        let turn = Turn::model(reply);
        assert_eq!(turn.speaker, Speaker::Model);
        assert!(matches!(turn.parts[0], Part::Text(_)));
        assert!(matches!(turn.parts[1], Part::Call(_)));
    }

    #[test]
    fn test_empty_text_is_dropped() {
        assert!(ModelReply::default().into_parts().is_empty());
    }
}
