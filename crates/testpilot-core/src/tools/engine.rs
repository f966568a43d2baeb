use super::{fetch, fs, shell, ToolRequest, Workspace};
use crate::ai::TextGenerator;
use crate::config::Config;
use crate::embeddings::HttpEmbedder;
use crate::error::ToolError;
use crate::protocol::{Envelope, EnvelopeSender, STATUS_TOOL_RESULT};
use crate::similarity::SqliteIndex;
use crate::testgen::{GoTestRunner, TestGenRequest, TestGenerator};
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

const RESULT_MESSAGE_CHARS: usize = 120;

/// Result of one invocation, handed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
        }
    }
}

/// Validates and executes tool calls against the working root.
pub struct ToolEngine {
    workspace: Workspace,
    config: Arc<Config>,
    generator: Arc<dyn TextGenerator>,
    http: Client,
    test_generator: Option<TestGenerator>,
}

impl ToolEngine {
    pub fn new(config: Arc<Config>, generator: Arc<dyn TextGenerator>) -> Result<Self, ToolError> {
        let workspace = Workspace::new(config.resolve_work_dir())?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ToolError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            workspace,
            config,
            generator,
            http,
            test_generator: None,
        })
    }

    /// Use a prebuilt test generator instead of constructing one from the
    /// configuration on each call.
    pub fn with_test_generator(mut self, test_generator: TestGenerator) -> Self {
        self.test_generator = Some(test_generator);
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Emit `tool_call`, execute, then emit `response` or `error`. Failures
    /// never escape; they come back as a failed [`ToolOutput`].
    pub async fn invoke(
        &self,
        name: &str,
        args: &Map<String, Value>,
        events: &EnvelopeSender,
    ) -> ToolOutput {
        let _ = events.send(Envelope::tool_call(name, args.clone()));
        info!(tool = name, "Executing tool");

        match self.execute(name, args, events).await {
            Ok(content) => {
                let _ = events.send(Envelope::status(
                    STATUS_TOOL_RESULT,
                    &result_message(name, &content),
                ));
                ToolOutput::ok(content)
            }
            Err(err) => {
                warn!(tool = name, kind = err.kind(), error = %err, "Tool failed");
                let _ = events.send(Envelope::error(
                    &format!("{} failed: {}", name, err),
                    Some(err.kind()),
                ));
                ToolOutput::fail(err.to_string())
            }
        }
    }

    async fn execute(
        &self,
        name: &str,
        args: &Map<String, Value>,
        events: &EnvelopeSender,
    ) -> Result<String, ToolError> {
        match ToolRequest::parse(name, args)? {
            ToolRequest::ReadFile(a) => fs::read_file(&self.workspace, &a.file_path).await,
            ToolRequest::WriteFile(a) => fs::write_file(&self.workspace, &a).await,
            ToolRequest::EditFile(a) => fs::edit_file(&self.workspace, &a).await,
            ToolRequest::ListFiles(a) => fs::list_files(&self.workspace, &a).await,
            ToolRequest::SearchFiles(a) => fs::search_files(&self.workspace, &a).await,
            ToolRequest::RunCommand(a) => shell::run_command(&self.workspace, &a).await,
            ToolRequest::UrlExtract(a) => {
                fetch::url_extract(&self.http, self.config.request_timeout().as_secs(), &a).await
            }
            ToolRequest::GenerateUnitTests(a) => {
                let request = TestGenRequest::from_args(&self.workspace, &a)?;
                let report = self.test_generator()?.run(&request, events).await?;
                serde_json::to_string_pretty(&report)
                    .map_err(|e| ToolError::Internal(format!("Failed to encode report: {}", e)))
            }
        }
    }

    /// Collaborators are built on first use so a missing setting is reported
    /// by the tool that needs it.
    fn test_generator(&self) -> Result<TestGenerator, ToolError> {
        if let Some(prebuilt) = &self.test_generator {
            return Ok(prebuilt.clone());
        }

        let embedder = HttpEmbedder::from_config(&self.config)?;
        let index = SqliteIndex::from_config(&self.config)?;
        Ok(TestGenerator::new(
            Arc::new(embedder),
            Arc::new(index),
            Arc::clone(&self.generator),
            Arc::new(GoTestRunner::new(self.config.runner_timeout())),
        ))
    }
}

fn result_message(name: &str, content: &str) -> String {
    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first_line.is_empty() {
        format!("{} completed", name)
    } else {
        format!(
            "{}: {}",
            name,
            super::truncate_chars(first_line.trim(), RESULT_MESSAGE_CHARS)
        )
    }
}
