//! One worker session: envelopes in on stdin, envelopes out on stdout.
//!
//! Handlers never write to the output directly. They push onto an unbounded
//! channel and a single writer task drains it, so every emitted line is one
//! whole envelope.

use std::sync::Arc;

use testpilot_core::ai::{ChatModel, GeminiClient, TextGenerator};
use testpilot_core::protocol::{ChatPayload, InitPayload};
use testpilot_core::{
    Config, Envelope, EnvelopeReader, EnvelopeSender, EnvelopeWriter, MessageType,
    ServiceError, StreamError, ToolEngine,
};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;

pub const NOT_INITIALIZED: &str = "agent not initialized";

/// Model handles created once the credential arrives.
pub struct Backends {
    pub chat: Arc<dyn ChatModel>,
    pub generator: Arc<dyn TextGenerator>,
}

pub trait BackendFactory: Send + Sync {
    fn build(&self, api_key: &str, config: &Config) -> Result<Backends, ServiceError>;
}

pub struct GeminiBackends;

impl BackendFactory for GeminiBackends {
    fn build(&self, api_key: &str, config: &Config) -> Result<Backends, ServiceError> {
        let client = Arc::new(GeminiClient::new(api_key, config)?);
        Ok(Backends {
            chat: client.clone(),
            generator: client,
        })
    }
}

pub struct Session {
    config: Arc<Config>,
    factory: Arc<dyn BackendFactory>,
    events: EnvelopeSender,
    agent: Option<Agent>,
}

impl Session {
    pub fn new(config: Arc<Config>, factory: Arc<dyn BackendFactory>, events: EnvelopeSender) -> Self {
        Self {
            config,
            factory,
            events,
            agent: None,
        }
    }

    pub async fn handle(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Init => {
                let init: InitPayload = envelope.payload();
                self.initialize(&init.api_key);
            }
            MessageType::Chat => {
                let chat: ChatPayload = envelope.payload();
                match self.agent.as_mut() {
                    Some(agent) => agent.run_turn(&chat.message, &self.events).await,
                    None => self.emit(Envelope::error(NOT_INITIALIZED, None)),
                }
            }
            other => debug!(?other, "Ignoring envelope"),
        }
    }

    fn initialize(&mut self, api_key: &str) {
        // The credential from the client wins over the configured one.
        let api_key = Some(api_key.trim())
            .filter(|k| !k.is_empty())
            .or_else(|| self.config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()));
        let Some(api_key) = api_key else {
            self.emit(Envelope::error("API key is required", Some("configuration")));
            return;
        };

        let backends = match self.factory.build(api_key, &self.config) {
            Ok(backends) => backends,
            Err(err) => {
                error!(error = %err, "Failed to create model client");
                self.emit(Envelope::error(
                    &format!("Failed to initialize agent: {}", err),
                    Some("service"),
                ));
                return;
            }
        };

        let engine = match ToolEngine::new(Arc::clone(&self.config), backends.generator) {
            Ok(engine) => engine,
            Err(err) => {
                error!(error = %err, "Failed to create tool engine");
                self.emit(Envelope::error(
                    &format!("Failed to initialize agent: {}", err),
                    Some(err.kind()),
                ));
                return;
            }
        };

        info!(root = %engine.workspace().root().display(), "Agent initialized");
        self.agent = Some(Agent::new(backends.chat, engine));
        self.emit(Envelope::initialized("Agent initialized"));
    }

    fn emit(&self, envelope: Envelope) {
        if self.events.send(envelope).is_err() {
            warn!("Output closed, dropping envelope");
        }
    }
}

/// Serve until the input closes. Requests are handled one at a time in
/// arrival order.
pub async fn serve<R, W>(
    config: Arc<Config>,
    factory: Arc<dyn BackendFactory>,
    input: R,
    output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        let mut writer = EnvelopeWriter::new(output);
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = writer.send(&envelope).await {
                error!("Failed to write envelope: {}", e);
                break;
            }
        }
    });

    let mut reader = EnvelopeReader::new(input);
    let mut session = Session::new(config, factory, tx);

    let result = loop {
        match reader.next_envelope().await {
            Ok(envelope) => session.handle(envelope).await,
            Err(StreamError::Closed) => {
                info!("Input closed, shutting down");
                break Ok(());
            }
            Err(e) => break Err(anyhow::Error::new(e).context("Failed to read from client")),
        }
    };

    if reader.skipped() > 0 {
        warn!(skipped = reader.skipped(), "Ignored non-envelope input lines");
    }

    // Dropping the last sender lets the writer flush and finish.
    drop(session);
    let _ = writer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use testpilot_core::ai::{FunctionDeclaration, ModelReply, Turn};
    use testpilot_core::protocol::{ErrorPayload, ResponsePayload, STATUS_INITIALIZED};
    use tokio::io::{AsyncReadExt, BufReader};

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn complete(
            &self,
            _system: &str,
            history: &[Turn],
            _functions: &[FunctionDeclaration],
        ) -> Result<ModelReply, ServiceError> {
            let last = history
                .last()
                .and_then(|turn| turn.parts.first())
                .map(|part| format!("{:?}", part))
                .unwrap_or_default();
            Ok(ModelReply::text(&format!("echo {}", last)))
        }
    }

    #[async_trait]
    impl TextGenerator for EchoModel {
        async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
            Ok(prompt.to_string())
        }
    }

    struct FakeBackends;

    impl BackendFactory for FakeBackends {
        fn build(&self, _api_key: &str, _config: &Config) -> Result<Backends, ServiceError> {
            Ok(Backends {
                chat: Arc::new(EchoModel),
                generator: Arc::new(EchoModel),
            })
        }
    }

    async fn run_session(input: &str) -> Vec<Envelope> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new();
        config.work_dir = Some(dir.path().to_path_buf());

        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(
            Arc::new(config),
            Arc::new(FakeBackends),
            BufReader::new(input.as_bytes()),
            server,
        )
        .await
        .unwrap();

        let mut raw = String::new();
        let mut client = client;
        client.read_to_string(&mut raw).await.unwrap();
        raw.lines().map(|l| Envelope::decode(l).unwrap()).collect()
    }

    fn line(envelope: Envelope) -> String {
        format!("{}\n", envelope.encode().unwrap())
    }

    #[tokio::test]
    async fn test_chat_before_init_is_rejected() {
        let out = run_session(&line(Envelope::chat("hello"))).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload::<ErrorPayload>().message, NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_init_then_chat() {
        let input = line(Envelope::init("key")) + &line(Envelope::chat("hello"));
        let out = run_session(&input).await;

        let first: ResponsePayload = out[0].payload();
        assert_eq!(first.status.as_deref(), Some(STATUS_INITIALIZED));
        assert_eq!(out[1], Envelope::thinking());
        let answer: ResponsePayload = out.last().unwrap().payload();
        assert!(answer.content.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_blank_key_is_rejected() {
        let out = run_session(&line(Envelope::init("  "))).await;
        let error: ErrorPayload = out[0].payload();
        assert_eq!(error.message, "API key is required");
        assert_eq!(error.details.as_deref(), Some("configuration"));
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let input = format!("not json\n\n{}", line(Envelope::chat("hi")));
        let out = run_session(&input).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageType::Error);
    }
}
