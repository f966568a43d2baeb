//! Tool catalogue and dispatch.
//!
//! Each tool is declared once in [`CATALOG`]. The declaration drives argument
//! validation, the function schema handed to the model, and the one-line
//! summary the front-end shows for a `tool_call` envelope.

mod engine;
mod fetch;
mod fs;
mod shell;

pub use engine::{ToolEngine, ToolOutput};
pub use fs::Workspace;
pub(crate) use fs::collect_files;
pub(crate) use shell::run_with_timeout;

use crate::ai::FunctionDeclaration;
use crate::error::ToolError;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const EDIT_FILE: &str = "edit_file";
pub const LIST_FILES: &str = "list_files";
pub const SEARCH_FILES: &str = "search_files";
pub const RUN_COMMAND: &str = "run_command";
pub const URL_EXTRACT: &str = "url_extract";
pub const GENERATE_UNIT_TESTS: &str = "generate_unit_tests";
pub const RUN_TESTS: &str = "run_tests";

const GENERIC_VALUE_LIMIT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    StringList,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value
                .as_f64()
                .map(|n| n.fract() == 0.0)
                .unwrap_or(false),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
        }
    }

    fn schema(self) -> Value {
        match self {
            ParamKind::String => json!({ "type": "string" }),
            ParamKind::Integer => json!({ "type": "integer" }),
            ParamKind::Number => json!({ "type": "number" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::StringList => json!({ "type": "array", "items": { "type": "string" } }),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ParamKind::String => "a string",
            ParamKind::Integer => "an integer",
            ParamKind::Number => "a number",
            ParamKind::Boolean => "a boolean",
            ParamKind::StringList => "a list of strings",
        }
    }
}

/// How a parameter shows up in the compact tool-call summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    Hidden,
    /// `label: value`, optionally cut to a number of characters.
    Plain {
        label: &'static str,
        max_len: Option<usize>,
    },
    /// `label: "value"`
    Quoted { label: &'static str },
    /// Bare label, shown only when the flag is true.
    Flag { label: &'static str },
    /// `label: N%`
    Percent { label: &'static str },
    /// `label: [a,b]`
    List { label: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    pub summary: Summary,
    /// Rendered default; a value equal to it is left out of the summary.
    pub default: Option<&'static str>,
}

impl ParamSpec {
    const fn new(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
            summary: Summary::Hidden,
            default: None,
        }
    }

    const fn optional(self) -> Self {
        Self {
            required: false,
            ..self
        }
    }

    const fn shown(self, summary: Summary) -> Self {
        Self { summary, ..self }
    }

    const fn default_value(self, default: &'static str) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    fn summarize(&self, value: &Value) -> Option<String> {
        let rendered = render_plain(value);
        if self.default == Some(rendered.as_str()) {
            return None;
        }

        match self.summary {
            Summary::Hidden => None,
            Summary::Plain { label, max_len } => {
                let text = match max_len {
                    Some(limit) => truncate_chars(&rendered, limit),
                    None => rendered,
                };
                Some(format!("{}: {}", label, text))
            }
            Summary::Quoted { label } => Some(format!("{}: \"{}\"", label, rendered)),
            Summary::Flag { label } => (value.as_bool() == Some(true)).then(|| label.to_string()),
            Summary::Percent { label } => {
                value.as_f64().map(|n| format!("{}: {}%", label, n as i64))
            }
            Summary::List { label } => {
                let items: Vec<&str> = value
                    .as_array()?
                    .iter()
                    .filter_map(Value::as_str)
                    .collect();
                (!items.is_empty()).then(|| format!("{}: [{}]", label, items.join(",")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    /// Offered to the model. Internal tools are only emitted by other tools.
    pub exposed: bool,
}

impl ToolSpec {
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), ToolError> {
        for param in self.params {
            match args.get(param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(ToolError::InvalidArguments {
                            tool: self.name.to_string(),
                            reason: format!("missing required parameter '{}'", param.name),
                        });
                    }
                }
                Some(value) => {
                    if !param.kind.accepts(value) {
                        return Err(ToolError::InvalidArguments {
                            tool: self.name.to_string(),
                            reason: format!(
                                "parameter '{}' must be {}",
                                param.name,
                                param.kind.describe()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in self.params {
            let mut schema = param.kind.schema();
            schema["description"] = Value::String(param.description.to_string());
            properties.insert(param.name.to_string(), schema);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.json_schema(),
        }
    }
}

const FILE_PATH: ParamSpec =
    ParamSpec::new("filePath", ParamKind::String, "Path relative to the working directory")
        .shown(Summary::Plain {
            label: "file",
            max_len: None,
        });

pub static CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: READ_FILE,
        description: "Read the contents of a text file",
        params: &[FILE_PATH],
        exposed: true,
    },
    ToolSpec {
        name: WRITE_FILE,
        description: "Create or overwrite a file with the given content",
        params: &[
            FILE_PATH,
            ParamSpec::new("content", ParamKind::String, "Full file content"),
        ],
        exposed: true,
    },
    ToolSpec {
        name: EDIT_FILE,
        description: "Replace exactly one occurrence of oldText with newText in a file",
        params: &[
            FILE_PATH,
            ParamSpec::new("oldText", ParamKind::String, "Text to replace; must match once"),
            ParamSpec::new("newText", ParamKind::String, "Replacement text"),
        ],
        exposed: true,
    },
    ToolSpec {
        name: LIST_FILES,
        description: "List files in a directory",
        params: &[
            ParamSpec::new("dirPath", ParamKind::String, "Directory to list (default: .)")
                .optional()
                .shown(Summary::Plain {
                    label: "dir",
                    max_len: None,
                }),
            ParamSpec::new("recursive", ParamKind::Boolean, "Descend into subdirectories")
                .optional()
                .shown(Summary::Flag { label: "recursive" }),
        ],
        exposed: true,
    },
    ToolSpec {
        name: SEARCH_FILES,
        description: "Search file contents with a regular expression",
        params: &[
            ParamSpec::new("pattern", ParamKind::String, "Regular expression to search for")
                .shown(Summary::Quoted { label: "pattern" }),
            ParamSpec::new("directory", ParamKind::String, "Directory to search (default: .)")
                .optional()
                .shown(Summary::Plain {
                    label: "in",
                    max_len: None,
                })
                .default_value("."),
            ParamSpec::new("filePattern", ParamKind::String, "Only search files matching e.g. *.go")
                .optional(),
        ],
        exposed: true,
    },
    ToolSpec {
        name: RUN_COMMAND,
        description: "Run a shell command in the working directory",
        params: &[
            ParamSpec::new("command", ParamKind::String, "Shell command line").shown(
                Summary::Plain {
                    label: "cmd",
                    max_len: Some(50),
                },
            ),
            ParamSpec::new("timeout", ParamKind::Integer, "Timeout in seconds (default: 30)")
                .optional(),
        ],
        exposed: true,
    },
    ToolSpec {
        name: URL_EXTRACT,
        description: "Fetch a web page and return its text or HTML",
        params: &[
            ParamSpec::new("url", ParamKind::String, "http(s) URL to fetch").shown(
                Summary::Plain {
                    label: "url",
                    max_len: Some(50),
                },
            ),
            ParamSpec::new("formats", ParamKind::StringList, "Any of: text, html (default: text)")
                .optional()
                .shown(Summary::List { label: "formats" }),
        ],
        exposed: true,
    },
    ToolSpec {
        name: GENERATE_UNIT_TESTS,
        description: "Generate a Go test file for a source file, run it, and regenerate on failure",
        params: &[
            FILE_PATH,
            ParamSpec::new("testFramework", ParamKind::String, "testing (default) or testify")
                .optional()
                .shown(Summary::Plain {
                    label: "framework",
                    max_len: None,
                })
                .default_value("testing"),
            ParamSpec::new("coverageTarget", ParamKind::Number, "Target line coverage percentage")
                .optional()
                .shown(Summary::Percent { label: "coverage" }),
        ],
        exposed: true,
    },
    ToolSpec {
        name: RUN_TESTS,
        description: "Run a generated test file",
        params: &[
            FILE_PATH,
            ParamSpec::new("attempt", ParamKind::Integer, "Attempt number").shown(
                Summary::Plain {
                    label: "attempt",
                    max_len: None,
                },
            ),
        ],
        exposed: false,
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Function declarations for every tool the model may call.
pub fn declarations() -> Vec<FunctionDeclaration> {
    CATALOG
        .iter()
        .filter(|spec| spec.exposed)
        .map(ToolSpec::declaration)
        .collect()
}

/// One-line rendering of a tool call, e.g. `🔧 Tool: read_file | file: main.go`.
pub fn summarize_call(name: &str, args: &Map<String, Value>) -> String {
    let params: Vec<String> = match find(name) {
        Some(spec) => spec
            .params
            .iter()
            .filter_map(|param| param.summarize(args.get(param.name)?))
            .collect(),
        None => args
            .iter()
            .map(|(key, value)| format!("{}: {}", key, render_generic(value)))
            .collect(),
    };

    let mut line = format!("🔧 Tool: {}", name);
    if !params.is_empty() {
        line.push_str(" | ");
        line.push_str(&params.join(", "));
    }
    line
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .map(render_plain)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn render_generic(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", truncate_chars(s, GENERIC_VALUE_LIMIT)),
        other => render_plain(other),
    }
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileArgs {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileArgs {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFileArgs {
    pub file_path: String,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesArgs {
    #[serde(default)]
    pub dir_path: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilesArgs {
    pub pattern: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub file_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommandArgs {
    pub command: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlExtractArgs {
    pub url: String,
    #[serde(default)]
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTestsArgs {
    pub file_path: String,
    #[serde(default)]
    pub test_framework: Option<String>,
    #[serde(default)]
    pub coverage_target: Option<f64>,
}

/// A validated request for one of the exposed tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    EditFile(EditFileArgs),
    ListFiles(ListFilesArgs),
    SearchFiles(SearchFilesArgs),
    RunCommand(RunCommandArgs),
    UrlExtract(UrlExtractArgs),
    GenerateUnitTests(GenerateTestsArgs),
}

impl ToolRequest {
    pub fn parse(name: &str, args: &Map<String, Value>) -> Result<Self, ToolError> {
        let spec = find(name)
            .filter(|spec| spec.exposed)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        spec.validate(args)?;

        let value = Value::Object(args.clone());
        let invalid = |e: serde_json::Error| ToolError::InvalidArguments {
            tool: name.to_string(),
            reason: e.to_string(),
        };

        let request = match spec.name {
            READ_FILE => ToolRequest::ReadFile(serde_json::from_value(value).map_err(invalid)?),
            WRITE_FILE => ToolRequest::WriteFile(serde_json::from_value(value).map_err(invalid)?),
            EDIT_FILE => ToolRequest::EditFile(serde_json::from_value(value).map_err(invalid)?),
            LIST_FILES => ToolRequest::ListFiles(serde_json::from_value(value).map_err(invalid)?),
            SEARCH_FILES => {
                ToolRequest::SearchFiles(serde_json::from_value(value).map_err(invalid)?)
            }
            RUN_COMMAND => {
                ToolRequest::RunCommand(serde_json::from_value(value).map_err(invalid)?)
            }
            URL_EXTRACT => {
                ToolRequest::UrlExtract(serde_json::from_value(value).map_err(invalid)?)
            }
            GENERATE_UNIT_TESTS => {
                ToolRequest::GenerateUnitTests(serde_json::from_value(value).map_err(invalid)?)
            }
            _ => return Err(ToolError::UnknownTool(name.to_string())),
        };
        Ok(request)
    }
}
