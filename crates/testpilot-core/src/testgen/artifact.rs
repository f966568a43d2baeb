//! Turning generated text into a Go test file on disk.

use crate::error::ToolError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TESTIFY_ASSERT: &str = "\"github.com/stretchr/testify/assert\"";
const TESTIFY_REQUIRE: &str = "\"github.com/stretchr/testify/require\"";
const SKIP_REASON_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framework {
    #[default]
    Testing,
    Testify,
}

impl Framework {
    pub fn parse(name: Option<&str>) -> Result<Self, ToolError> {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("testing") => Ok(Framework::Testing),
            Some("testify") => Ok(Framework::Testify),
            Some(other) => Err(ToolError::Validation(format!(
                "Unsupported test framework '{}' (expected testing or testify)",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Framework::Testing => "testing",
            Framework::Testify => "testify",
        }
    }
}

/// `pkg/calc.go` -> `pkg/calc_test.go`
pub fn test_path_for(source: &Path) -> Result<PathBuf, ToolError> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if name.ends_with("_test.go") {
        return Err(ToolError::Validation(format!(
            "{} is already a test file",
            source.display()
        )));
    }
    let stem = name.strip_suffix(".go").ok_or_else(|| {
        ToolError::Validation(format!("{} is not a Go source file", source.display()))
    })?;

    Ok(source.with_file_name(format!("{}_test.go", stem)))
}

fn package_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?m)^\s*package\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("package regex must compile")
    })
}

pub fn package_name(source: &str) -> Option<&str> {
    package_regex()
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// The code inside the first fenced block, or the whole text if unfenced.
pub fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text.trim();
    };
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];

    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

struct SplitSource<'a> {
    imports: Vec<String>,
    code: Vec<&'a str>,
}

/// Separate import specs from the rest of a generated file, dropping any
/// leading package clause.
fn split_imports(text: &str) -> SplitSource<'_> {
    let mut imports = Vec::new();
    let mut code = Vec::new();
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if in_block {
            if trimmed == ")" {
                in_block = false;
            } else if !trimmed.is_empty() && !trimmed.starts_with("//") {
                imports.push(trimmed.to_string());
            }
            continue;
        }

        let in_header = code.iter().all(|l: &&str| l.trim().is_empty());
        if in_header && trimmed.starts_with("package ") {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("import") {
            let rest = rest.trim();
            if rest == "(" {
                in_block = true;
                continue;
            }
            if rest.ends_with('"') {
                imports.push(rest.to_string());
                continue;
            }
        }
        code.push(line);
    }

    SplitSource { imports, code }
}

/// Prefix the generated body with the package clause and a merged import
/// block. Framework imports come first; duplicates are dropped.
pub fn assemble(package: &str, framework: Framework, generated: &str) -> String {
    let split = split_imports(strip_code_fences(generated));
    let code = split.code.join("\n");

    let mut imports = vec!["\"testing\"".to_string()];
    if framework == Framework::Testify {
        if code.contains("assert.") {
            imports.push(TESTIFY_ASSERT.to_string());
        }
        if code.contains("require.") {
            imports.push(TESTIFY_REQUIRE.to_string());
        }
    }
    for spec in split.imports {
        if !imports.contains(&spec) {
            imports.push(spec);
        }
    }

    let mut out = format!("package {}\n\nimport (\n", package);
    for spec in &imports {
        out.push('\t');
        out.push_str(spec);
        out.push('\n');
    }
    out.push_str(")\n\n");
    out.push_str(code.trim());
    out.push('\n');
    out
}

fn go_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars().take(SKIP_REASON_MAX_CHARS) {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A compiling test file with a single skipped test explaining why no real
/// tests were produced.
pub fn placeholder(package: &str, reason: &str) -> String {
    format!(
        "package {}\n\nimport \"testing\"\n\nfunc TestGenerationSkipped(t *testing.T) {{\n\tt.Skip({})\n}}\n",
        package,
        go_string_literal(&format!("test generation failed: {}", reason))
    )
}
