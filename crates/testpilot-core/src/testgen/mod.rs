//! Generate, run, diagnose and regenerate Go unit tests.
//!
//! One run reads the source, retrieves similar code through the embedding
//! service and similarity store, asks the generative backend for a test file
//! and executes it. Failures are classified and fed back into a bounded number
//! of regeneration attempts. Some artifact is always left on disk.

pub mod artifact;
pub mod classify;
pub mod prompt;
pub mod runner;

pub use artifact::Framework;
pub use classify::{classify, Guidance, Outcome};
pub use runner::{GoTestRunner, RunOutput, TestRunner};

use crate::ai::TextGenerator;
use crate::embeddings::Embedder;
use crate::error::ToolError;
use crate::protocol::{Envelope, EnvelopeSender, STATUS_NOTICE, STATUS_TOOL_RESULT};
use crate::similarity::SimilarityIndex;
use crate::tools::{GenerateTestsArgs, Workspace, RUN_TESTS};
use artifact::{assemble, package_name, placeholder, test_path_for};
use prompt::{generation_prompt, repair_prompt, PromptInput};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_RETRIES: u32 = 3;
pub const NEIGHBOR_COUNT: usize = 10;

const ERROR_SUMMARY_CHARS: usize = 200;

/// Validated input of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestGenRequest {
    pub source: PathBuf,
    /// Source path relative to the working root, for messages.
    pub display_name: String,
    pub framework: Framework,
    pub coverage_target: Option<u8>,
}

impl TestGenRequest {
    pub fn from_args(workspace: &Workspace, args: &GenerateTestsArgs) -> Result<Self, ToolError> {
        let source = workspace.resolve_existing(&args.file_path)?;
        if !source.is_file() {
            return Err(ToolError::Validation(format!(
                "{} is not a file",
                args.file_path
            )));
        }
        test_path_for(&source)?;

        let framework = Framework::parse(args.test_framework.as_deref())?;
        let coverage_target = match args.coverage_target {
            None => None,
            Some(target) if (1.0..=100.0).contains(&target) => Some(target.round() as u8),
            Some(target) => {
                return Err(ToolError::Validation(format!(
                    "coverageTarget must be between 1 and 100, got {}",
                    target
                )))
            }
        };

        Ok(Self {
            display_name: workspace.display(&source),
            source,
            framework,
            coverage_target,
        })
    }
}

/// One pass through generate and run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_error: Option<String>,
    #[serde(skip)]
    pub artifact: String,
    pub outcome: Outcome,
    /// The backend failed and a skip-only file was written instead.
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestGenReport {
    pub success: bool,
    pub attempts: u32,
    pub test_file: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
    pub history: Vec<RetryAttempt>,
}

#[derive(Clone)]
pub struct TestGenerator {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn SimilarityIndex>,
    generator: Arc<dyn TextGenerator>,
    runner: Arc<dyn TestRunner>,
    max_retries: u32,
    neighbor_count: usize,
}

impl TestGenerator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn SimilarityIndex>,
        generator: Arc<dyn TextGenerator>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            runner,
            max_retries: MAX_RETRIES,
            neighbor_count: NEIGHBOR_COUNT,
        }
    }

    pub async fn run(
        &self,
        request: &TestGenRequest,
        events: &EnvelopeSender,
    ) -> Result<TestGenReport, ToolError> {
        let source = tokio::fs::read_to_string(&request.source).await?;
        let package = package_name(&source)
            .ok_or_else(|| {
                ToolError::Validation(format!(
                    "{} has no package clause",
                    request.display_name
                ))
            })?
            .to_string();
        let test_path = test_path_for(&request.source)?;
        let test_display = test_path_for(Path::new(&request.display_name))?
            .display()
            .to_string();

        let embedding = self.embedder.embed(&source).await?;
        let neighbors = self.index.nearest(&embedding, self.neighbor_count).await?;
        info!(
            source = %request.display_name,
            neighbors = neighbors.len(),
            framework = request.framework.name(),
            "Generating unit tests"
        );

        if test_path.exists() {
            let _ = events.send(Envelope::status(
                STATUS_NOTICE,
                &format!("{} already exists and will be overwritten", test_display),
            ));
        }

        let input = PromptInput {
            source_name: &request.display_name,
            source: &source,
            package: &package,
            framework: request.framework,
            coverage_target: request.coverage_target,
            neighbors: &neighbors,
        };

        let mut history: Vec<RetryAttempt> = Vec::new();
        // Last real artifact and the error it produced.
        let mut previous: Option<(String, String)> = None;
        let mut final_error: Option<String> = None;
        let mut last_output = String::new();

        for attempt in 1..=self.max_retries {
            let prompt = match &previous {
                None => generation_prompt(&input),
                Some((artifact, error)) => {
                    let guidance = Guidance::from_error(error);
                    info!(attempt, ?guidance, "Regenerating after failure");
                    repair_prompt(&input, artifact, error, guidance)
                }
            };
            let prior_error = final_error
                .as_deref()
                .map(|e| crate::tools::truncate_chars(e.trim(), ERROR_SUMMARY_CHARS));

            let (artifact, backend_error) = match self.generator.generate(&prompt).await {
                Ok(text) => (assemble(&package, request.framework, &text), None),
                Err(err) => {
                    warn!(attempt, error = %err, "Generative backend failed, writing placeholder");
                    (placeholder(&package, &err.to_string()), Some(err.to_string()))
                }
            };
            tokio::fs::write(&test_path, &artifact).await?;
            let is_placeholder = backend_error.is_some();

            let outcome = match backend_error {
                Some(reason) => {
                    final_error = Some(format!("test generation failed: {}", reason));
                    Outcome::Fail
                }
                None => {
                    let run = self
                        .run_tests(&test_path, &test_display, attempt, events)
                        .await?;
                    last_output = run.combined();
                    let outcome = classify(&run);
                    if outcome == Outcome::Fail {
                        final_error = Some(last_output.clone());
                        previous = Some((artifact.clone(), last_output.clone()));
                    }
                    outcome
                }
            };

            history.push(RetryAttempt {
                attempt,
                prior_error,
                artifact,
                placeholder: is_placeholder,
                outcome,
            });

            if outcome == Outcome::Pass {
                info!(attempt, test_file = %test_display, "Generated tests pass");
                return Ok(TestGenReport {
                    success: true,
                    attempts: attempt,
                    test_file: test_display,
                    output: last_output,
                    final_error: None,
                    history,
                });
            }
        }

        warn!(attempts = self.max_retries, test_file = %test_display, "Generated tests still failing");
        Ok(TestGenReport {
            success: false,
            attempts: self.max_retries,
            test_file: test_display,
            output: last_output,
            final_error,
            history,
        })
    }

    async fn run_tests(
        &self,
        test_path: &Path,
        test_display: &str,
        attempt: u32,
        events: &EnvelopeSender,
    ) -> Result<RunOutput, ToolError> {
        let mut args = Map::new();
        args.insert("filePath".to_string(), Value::String(test_display.to_string()));
        args.insert("attempt".to_string(), json!(attempt));
        let _ = events.send(Envelope::tool_call(RUN_TESTS, args));

        match self.runner.run(test_path).await {
            Ok(output) => {
                let verdict = match classify(&output) {
                    Outcome::Pass => "passed",
                    Outcome::Fail => "failed",
                };
                let _ = events.send(Envelope::status(
                    STATUS_TOOL_RESULT,
                    &format!("Attempt {}: tests {}", attempt, verdict),
                ));
                Ok(output)
            }
            Err(err) => {
                let _ = events.send(Envelope::error(
                    &format!("run_tests failed: {}", err),
                    Some("io"),
                ));
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::protocol::{MessageType, ToolCallPayload};
    use crate::similarity::Neighbor;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const SOURCE: &str = "package calc\n\nfunc Add(a, b int) int { return a + b }\n";

    struct FixedEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
            if self.fail {
                Err(ServiceError::Request {
                    service: "Embedding service",
                    reason: "connection refused".to_string(),
                })
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    struct FixedIndex;

    #[async_trait]
    impl SimilarityIndex for FixedIndex {
        async fn nearest(&self, _embedding: &[f32], k: usize) -> Result<Vec<Neighbor>, ServiceError> {
            assert_eq!(k, NEIGHBOR_COUNT);
            Ok(vec![Neighbor {
                source_location: "mathx/mul.go:1-3".to_string(),
                content: "func Mul(a, b int) int { return a * b }".to_string(),
                distance: 0.2,
            }])
        }
    }

    #[derive(Default)]
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, ServiceError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String, ServiceError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("func TestAdd(t *testing.T) {}".to_string()))
        }
    }

    #[derive(Default)]
    struct ScriptedRunner {
        outputs: Mutex<VecDeque<RunOutput>>,
        runs: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<RunOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                runs: Mutex::new(0),
            }
        }

        fn runs(&self) -> u32 {
            *self.runs.lock().unwrap()
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run(&self, _test_file: &Path) -> io::Result<RunOutput> {
            *self.runs.lock().unwrap() += 1;
            Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_else(failing))
        }
    }

    fn passing() -> RunOutput {
        RunOutput {
            exit_code: Some(0),
            stdout: "--- PASS: TestAdd (0.00s)\nPASS\nok  \tcalc\t0.001s".to_string(),
            ..RunOutput::default()
        }
    }

    fn failing() -> RunOutput {
        RunOutput {
            exit_code: Some(1),
            stdout: "FAIL\tcalc [build failed]".to_string(),
            stderr: "./calc_test.go:6:9: undefined: Mul".to_string(),
            timed_out: false,
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        request: TestGenRequest,
        generator: Arc<ScriptedGenerator>,
        runner: Arc<ScriptedRunner>,
        engine: TestGenerator,
    }

    fn fixture(replies: Vec<Result<String, ServiceError>>, outputs: Vec<RunOutput>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.go"), SOURCE).unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        let request = TestGenRequest::from_args(
            &workspace,
            &GenerateTestsArgs {
                file_path: "calc.go".to_string(),
                test_framework: None,
                coverage_target: None,
            },
        )
        .unwrap();

        let generator = Arc::new(ScriptedGenerator::new(replies));
        let runner = Arc::new(ScriptedRunner::new(outputs));
        let engine = TestGenerator::new(
            Arc::new(FixedEmbedder { fail: false }),
            Arc::new(FixedIndex),
            generator.clone(),
            runner.clone(),
        );

        Fixture {
            dir,
            request,
            generator,
            runner,
            engine,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let fx = fixture(
            vec![
                Ok("```go\nfunc TestAdd(t *testing.T) { Mul(1, 2) }\n```".to_string()),
                Ok("```go\nfunc TestAdd(t *testing.T) { _ = Add(1, 2) }\n```".to_string()),
            ],
            vec![failing(), passing()],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = fx.engine.run(&fx.request, &tx).await.unwrap();

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.test_file, "calc_test.go");
        assert_eq!(report.history[0].outcome, Outcome::Fail);
        assert_eq!(report.history[1].outcome, Outcome::Pass);
        assert!(report.history[1].prior_error.as_deref().unwrap().contains("undefined: Mul"));

        let prompts = fx.generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("mathx/mul.go:1-3"));
        assert!(prompts[1].contains(Guidance::UndefinedReference.instruction()));
        assert!(prompts[1].contains("undefined: Mul"));

        let on_disk = std::fs::read_to_string(fx.dir.path().join("calc_test.go")).unwrap();
        assert!(on_disk.starts_with("package calc\n"));
        assert!(on_disk.contains("_ = Add(1, 2)"));

        let run_calls = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == MessageType::ToolCall)
            .filter(|e| e.payload::<ToolCallPayload>().tool_name == RUN_TESTS)
            .count();
        assert_eq!(run_calls, 2);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let fx = fixture(Vec::new(), Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = fx.engine.run(&fx.request, &tx).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.attempts, MAX_RETRIES);
        assert_eq!(fx.runner.runs(), MAX_RETRIES);
        assert_eq!(fx.generator.prompts.lock().unwrap().len(), MAX_RETRIES as usize);
        assert!(report.final_error.unwrap().contains("undefined: Mul"));
        assert!(fx.dir.path().join("calc_test.go").exists());
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_placeholder() {
        let unavailable = || {
            Err(ServiceError::Status {
                service: "Gemini API",
                status: 503,
                body: "overloaded".to_string(),
            })
        };
        let fx = fixture(vec![unavailable(), unavailable(), unavailable()], Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = fx.engine.run(&fx.request, &tx).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.attempts, MAX_RETRIES);
        assert_eq!(fx.runner.runs(), 0);
        assert!(report.history.iter().all(|a| a.placeholder));
        assert!(report.final_error.unwrap().contains("503"));

        let on_disk = std::fs::read_to_string(fx.dir.path().join("calc_test.go")).unwrap();
        assert!(on_disk.contains("t.Skip(\"test generation failed:"));
    }

    #[tokio::test]
    async fn test_backend_recovers_after_placeholder() {
        let fx = fixture(
            vec![Err(ServiceError::Timeout {
                service: "Gemini API",
                secs: 30,
            })],
            vec![passing()],
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = fx.engine.run(&fx.request, &tx).await.unwrap();

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert!(report.history[0].placeholder);
        assert!(!report.history[1].placeholder);
        assert_eq!(fx.runner.runs(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_fatal() {
        let mut fx = fixture(Vec::new(), Vec::new());
        fx.engine.embedder = Arc::new(FixedEmbedder { fail: true });
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = fx.engine.run(&fx.request, &tx).await.unwrap_err();

        assert_eq!(err.kind(), "service");
        assert!(fx.generator.prompts.lock().unwrap().is_empty());
        assert!(!fx.dir.path().join("calc_test.go").exists());
    }

    #[tokio::test]
    async fn test_notice_when_overwriting() {
        let fx = fixture(Vec::new(), vec![passing()]);
        std::fs::write(fx.dir.path().join("calc_test.go"), "old").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        fx.engine.run(&fx.request, &tx).await.unwrap();

        let notices = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                e.payload::<crate::protocol::ResponsePayload>().status.as_deref()
                    == Some(STATUS_NOTICE)
            })
            .count();
        assert_eq!(notices, 1);
    }

    #[test]
    fn test_request_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.go"), SOURCE).unwrap();
        std::fs::write(dir.path().join("calc_test.go"), "").unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();

        let args = |path: &str, coverage: Option<f64>| GenerateTestsArgs {
            file_path: path.to_string(),
            test_framework: None,
            coverage_target: coverage,
        };

        for bad in [
            args("missing.go", None),
            args("calc_test.go", None),
            args("calc.go", Some(150.0)),
        ] {
            let err = TestGenRequest::from_args(&workspace, &bad).unwrap_err();
            assert_eq!(err.kind(), "validation", "{:?}", bad);
        }

        let ok = TestGenRequest::from_args(&workspace, &args("calc.go", Some(80.0))).unwrap();
        assert_eq!(ok.coverage_target, Some(80));
        assert_eq!(ok.display_name, "calc.go");
    }
}
