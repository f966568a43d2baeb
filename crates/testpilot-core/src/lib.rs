pub mod ai;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod protocol;
pub mod similarity;
pub mod state;
pub mod testgen;
pub mod tools;

// Re-export main types for convenience
pub use ai::{ChatModel, GeminiClient, TextGenerator};
pub use config::Config;
pub use embeddings::{Embedder, HttpEmbedder};
pub use error::{ConfigError, ServiceError, StreamError, ToolError};
pub use protocol::{Envelope, EnvelopeReader, EnvelopeSender, EnvelopeWriter, MessageType};
pub use similarity::{Neighbor, SimilarityIndex, SqliteIndex};
pub use state::{Conversation, Phase, Role, TranscriptEntry};
pub use testgen::{TestGenReport, TestGenerator};
pub use tools::{ToolEngine, ToolOutput};
