use std::sync::Arc;

use serde_json::json;
use testpilot_core::ai::{ChatModel, FunctionDeclaration, ModelReply, Part, Turn};
use testpilot_core::protocol::{Envelope, EnvelopeSender};
use testpilot_core::tools::{self, ToolEngine};
use testpilot_core::ServiceError;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Model round-trips allowed for one chat turn.
pub const MAX_STEPS: usize = 12;

const EMPTY_ANSWER: &str = "(no response)";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ServiceError),

    #[error("stopped after {0} model steps without a final answer")]
    StepLimit(usize),
}

impl AgentError {
    fn kind(&self) -> &'static str {
        match self {
            AgentError::Model(_) => "service",
            AgentError::StepLimit(_) => "step_limit",
        }
    }
}

fn system_prompt(engine: &ToolEngine) -> String {
    format!(
        "You are a development assistant working inside the directory {}. \
         Use the available tools to inspect and change files, run commands and \
         fetch documentation. To write Go unit tests, call generate_unit_tests \
         rather than writing test files yourself. Paths are relative to the \
         working directory. Answer concisely once the task is done.",
        engine.workspace().root().display()
    )
}

/// One conversation with the model, holding the history across chat turns.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    engine: ToolEngine,
    system: String,
    functions: Vec<FunctionDeclaration>,
    history: Vec<Turn>,
    max_steps: usize,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatModel>, engine: ToolEngine) -> Self {
        Self {
            system: system_prompt(&engine),
            model,
            engine,
            functions: tools::declarations(),
            history: Vec::new(),
            max_steps: MAX_STEPS,
        }
    }

    /// Handle one `chat` message. Everything the client sees goes out
    /// through `events`.
    pub async fn run_turn(&mut self, message: &str, events: &EnvelopeSender) {
        let _ = events.send(Envelope::thinking());

        let mark = self.history.len();
        self.history.push(Turn::user(message));

        match self.drive(events).await {
            Ok(answer) => {
                let _ = events.send(Envelope::chunk(&answer));
                let _ = events.send(Envelope::answer(&answer));
            }
            Err(err) => {
                warn!(error = %err, "Chat turn failed");
                // Keep the history alternating for the next turn.
                self.history.truncate(mark);
                let _ = events.send(Envelope::error(&err.to_string(), Some(err.kind())));
            }
        }
    }

    async fn drive(&mut self, events: &EnvelopeSender) -> Result<String, AgentError> {
        for step in 1..=self.max_steps {
            let reply = self
                .model
                .complete(&self.system, &self.history, &self.functions)
                .await?;
            debug!(step, calls = reply.calls.len(), "Model replied");

            let calls = reply.calls.clone();
            let text = reply.text.trim().to_string();

            if calls.is_empty() {
                info!(steps = step, "Chat turn complete");
                if text.is_empty() {
                    // A turn without parts is rejected on every later request.
                    warn!(step, "Model returned an empty reply");
                    self.history.push(Turn::model(ModelReply::text(EMPTY_ANSWER)));
                    return Ok(EMPTY_ANSWER.to_string());
                }
                self.history.push(Turn::model(reply));
                return Ok(text);
            }

            self.history.push(Turn::model(reply));

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let output = self.engine.invoke(&call.name, &call.args, events).await;
                results.push(Part::Result {
                    name: call.name,
                    response: json!({ "ok": output.ok, "content": output.content }),
                });
            }
            self.history.push(Turn::results(results));
        }

        Err(AgentError::StepLimit(self.max_steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use testpilot_core::ai::{FunctionCall, TextGenerator};
    use testpilot_core::protocol::{ErrorPayload, MessageType, ResponsePayload};
    use testpilot_core::Config;
    use tokio::sync::mpsc;

    struct ScriptedModel {
        replies: Mutex<VecDeque<ModelReply>>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<ModelReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            _system: &str,
            history: &[Turn],
            functions: &[FunctionDeclaration],
        ) -> Result<ModelReply, ServiceError> {
            assert!(!functions.is_empty());
            self.seen.lock().unwrap().push(history.len());
            if history.iter().any(|turn| turn.parts.is_empty()) {
                return Err(ServiceError::Status {
                    service: "Gemini API",
                    status: 400,
                    body: "contents.parts must not be empty".to_string(),
                });
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(ServiceError::Request {
                    service: "Gemini API",
                    reason: "script exhausted".to_string(),
                })
        }
    }

    struct NoGenerator;

    #[async_trait]
    impl TextGenerator for NoGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, ServiceError> {
            Ok(String::new())
        }
    }

    fn call(name: &str, args: serde_json::Value) -> ModelReply {
        ModelReply {
            text: String::new(),
            calls: vec![FunctionCall {
                name: name.to_string(),
                args: args.as_object().cloned().unwrap_or_else(Map::new),
            }],
        }
    }

    fn agent(dir: &std::path::Path, model: Arc<ScriptedModel>) -> Agent {
        let mut config = Config::new();
        config.work_dir = Some(dir.to_path_buf());
        let engine = ToolEngine::new(Arc::new(config), Arc::new(NoGenerator)).unwrap();
        Agent::new(model, engine)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_tool_round_trip_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.go"), "package calc\n").unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            call("read_file", json!({"filePath": "calc.go"})),
            ModelReply::text("It declares package calc."),
        ]));
        let mut agent = agent(dir.path(), model.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent.run_turn("what package is calc.go?", &tx).await;

        let kinds: Vec<MessageType> = drain(&mut rx).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageType::StreamChunk,
                MessageType::ToolCall,
                MessageType::Response,
                MessageType::StreamChunk,
                MessageType::Response,
            ]
        );
        // user, model call, results
        assert_eq!(*model.seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(agent.history.len(), 4);
    }

    #[tokio::test]
    async fn test_final_answer_is_streamed_then_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![ModelReply::text("Hello")]));
        let mut agent = agent(dir.path(), model);
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent.run_turn("hi", &tx).await;

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().payload::<ResponsePayload>().content.as_deref(), Some("Hello"));
        assert_eq!(events[events.len() - 2], Envelope::chunk("Hello"));
    }

    #[tokio::test]
    async fn test_empty_reply_keeps_later_turns_working() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            ModelReply::default(),
            ModelReply::text("first"),
            ModelReply::text("second"),
        ]));
        let mut agent = agent(dir.path(), model.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent.run_turn("hi", &tx).await;
        agent.run_turn("again", &tx).await;
        agent.run_turn("and again", &tx).await;

        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e.kind != MessageType::Error));
        let answers: Vec<String> = events
            .iter()
            .filter(|e| e.kind == MessageType::Response)
            .filter_map(|e| e.payload::<ResponsePayload>().content)
            .collect();
        assert_eq!(answers, vec![EMPTY_ANSWER, "first", "second"]);
        assert_eq!(*model.seen.lock().unwrap(), vec![1, 3, 5]);
        assert!(agent.history.iter().all(|turn| !turn.parts.is_empty()));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let dir = tempfile::tempdir().unwrap();
        let replies = (0..MAX_STEPS).map(|_| call("list_files", json!({}))).collect();
        let mut agent = agent(dir.path(), Arc::new(ScriptedModel::new(replies)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent.run_turn("loop forever", &tx).await;

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.kind, MessageType::Error);
        let error: ErrorPayload = last.payload();
        assert!(error.message.contains("12 model steps"));
        assert!(agent.history.is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(dir.path(), Arc::new(ScriptedModel::new(Vec::new())));
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent.run_turn("hi", &tx).await;

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.payload::<ErrorPayload>().details.as_deref(), Some("service"));
    }
}
