//! Pass/fail verdicts and repair guidance for test runs.

use super::runner::RunOutput;
use serde::Serialize;

/// Markers of a build that never reached the test binary.
const COMPILE_MARKERS: &[&str] = &[
    "undefined reference",
    "undefined:",
    "redeclared",
    "unknown field",
    "syntax error",
    "too many errors",
    "[build failed]",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

pub fn has_compile_error(text: &str) -> bool {
    COMPILE_MARKERS.iter().any(|marker| text.contains(marker))
}

fn has_pass_signal(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        line == "PASS" || line.starts_with("ok ") || line.starts_with("ok\t")
    })
}

fn has_fail_signal(text: &str) -> bool {
    text.contains("FAIL") || has_compile_error(text)
}

/// Pass needs a pass signal, a clean exit and no failure signal anywhere.
pub fn classify(output: &RunOutput) -> Outcome {
    if output.timed_out || output.exit_code != Some(0) {
        return Outcome::Fail;
    }

    let text = output.combined();
    if has_pass_signal(&text) && !has_fail_signal(&text) {
        Outcome::Pass
    } else {
        Outcome::Fail
    }
}

/// Which repair instruction accompanies a regeneration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    DuplicateDeclaration,
    UndefinedReference,
    FieldMismatch,
    SyntaxError,
    Generic,
}

impl Guidance {
    pub fn from_error(text: &str) -> Self {
        if text.contains("redeclared") {
            Guidance::DuplicateDeclaration
        } else if text.contains("undefined:") || text.contains("undefined reference") {
            Guidance::UndefinedReference
        } else if text.contains("unknown field") {
            Guidance::FieldMismatch
        } else if text.contains("syntax error") {
            Guidance::SyntaxError
        } else {
            Guidance::Generic
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Guidance::DuplicateDeclaration => {
                "The previous test file redeclared identifiers that already exist in the package. \
                 Rename test helpers and variables so nothing collides with package-level names, \
                 and declare each test function only once."
            }
            Guidance::UndefinedReference => {
                "The previous test file referenced identifiers that do not exist. Only call \
                 functions, types and methods that are declared in the source file shown, and \
                 import every package you use."
            }
            Guidance::FieldMismatch => {
                "The previous test file used struct fields that do not exist. Use exactly the \
                 field names declared in the source file's struct definitions."
            }
            Guidance::SyntaxError => {
                "The previous test file did not parse. Return one complete, syntactically valid \
                 Go file with balanced braces and no surrounding prose."
            }
            Guidance::Generic => {
                "The previous tests failed. Read the failure output carefully, fix the wrong \
                 expectations, and keep every assertion consistent with the source's actual \
                 behaviour."
            }
        }
    }
}
