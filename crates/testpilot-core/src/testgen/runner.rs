use crate::tools::run_with_timeout;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunOutput {
    /// stdout followed by stderr, the text the classifier and prompts see.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the tests of the package containing `test_file`.
    async fn run(&self, test_file: &Path) -> io::Result<RunOutput>;
}

/// Runs `go test -v .` in the test file's directory.
#[derive(Debug, Clone)]
pub struct GoTestRunner {
    timeout: Duration,
}

impl GoTestRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TestRunner for GoTestRunner {
    async fn run(&self, test_file: &Path) -> io::Result<RunOutput> {
        let dir = test_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut command = Command::new("go");
        command.args(["test", "-v", "."]).current_dir(dir);
        debug!(dir = %dir.display(), "Running go test");

        match run_with_timeout(command, self.timeout).await? {
            Some(output) => Ok(RunOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            None => Ok(RunOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("test run timed out after {}s", self.timeout.as_secs()),
                timed_out: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let out = RunOutput {
            exit_code: Some(1),
            stdout: "--- FAIL: TestAdd".to_string(),
            stderr: "exit status 1".to_string(),
            timed_out: false,
        };
        assert_eq!(out.combined(), "--- FAIL: TestAdd\nexit status 1");

        let only_err = RunOutput {
            stderr: "build failed".to_string(),
            ..RunOutput::default()
        };
        assert_eq!(only_err.combined(), "build failed");
    }
}
