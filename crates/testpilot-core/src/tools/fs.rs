use super::{EditFileArgs, ListFilesArgs, SearchFilesArgs, WriteFileArgs};
use crate::error::ToolError;
use glob::Pattern;
use ignore::WalkBuilder;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

const READ_MAX_BYTES: usize = 256 * 1024;
const LIST_MAX_ENTRIES: usize = 500;
const SEARCH_MAX_MATCHES: usize = 100;
const SEARCH_LINE_MAX_CHARS: usize = 200;

/// Directories never listed or searched.
const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", "node_modules", "target", "vendor"];

/// The working root every path argument resolves against.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ToolError> {
        let root = root.into();
        let canonical = root.canonicalize().map_err(|e| {
            ToolError::Validation(format!(
                "Failed to resolve working directory {}: {}",
                root.display(),
                e
            ))
        })?;

        if !canonical.is_dir() {
            return Err(ToolError::Validation(format!(
                "Working directory {} is not a directory",
                canonical.display()
            )));
        }

        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf, ToolError> {
        if path.trim().is_empty() {
            return Err(ToolError::Validation("Path must not be empty".to_string()));
        }

        let candidate = self.absolute_candidate(path);
        let canonical = candidate.canonicalize().map_err(|e| {
            ToolError::Validation(format!("Failed to resolve path {}: {}", candidate.display(), e))
        })?;

        self.ensure_inside(&canonical)?;
        Ok(canonical)
    }

    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, ToolError> {
        if path.trim().is_empty() {
            return Err(ToolError::Validation("Path must not be empty".to_string()));
        }

        let candidate = self.absolute_candidate(path);
        let parent = candidate.parent().ok_or_else(|| {
            ToolError::Validation(format!("Path {} has no parent directory", candidate.display()))
        })?;

        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside(&anchor)?;

        // Reject `..` segments below the existing ancestor.
        let below = candidate.strip_prefix(parent).unwrap_or(&candidate);
        if parent
            .strip_prefix(&anchor)
            .unwrap_or(parent)
            .components()
            .chain(below.components())
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ToolError::Validation(format!(
                "Path escapes working directory: {}",
                candidate.display()
            )));
        }

        Ok(candidate)
    }

    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|relative| relative.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }

    fn absolute_candidate(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn ensure_inside(&self, canonical: &Path) -> Result<(), ToolError> {
        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(ToolError::Validation(format!(
                "Path escapes working directory: {}",
                canonical.display()
            )))
        }
    }
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, ToolError> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return Ok(ancestor.canonicalize()?);
        }
    }

    Err(ToolError::Validation(format!(
        "No existing ancestor found for path {}",
        path.display()
    )))
}

pub async fn read_file(workspace: &Workspace, path: &str) -> Result<String, ToolError> {
    let resolved = workspace.resolve_existing(path)?;
    let bytes = tokio::fs::read(&resolved).await?;

    if bytes.len() > READ_MAX_BYTES {
        return Err(ToolError::Validation(format!(
            "File exceeds max read size ({} bytes > {} bytes)",
            bytes.len(),
            READ_MAX_BYTES
        )));
    }

    String::from_utf8(bytes)
        .map_err(|_| ToolError::Validation("File is not valid UTF-8 text".to_string()))
}

pub async fn write_file(workspace: &Workspace, args: &WriteFileArgs) -> Result<String, ToolError> {
    let resolved = workspace.resolve_for_write(&args.file_path)?;
    if let Some(parent) = resolved.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&resolved, &args.content).await?;

    Ok(format!(
        "Wrote {} bytes to {}",
        args.content.len(),
        workspace.display(&resolved)
    ))
}

pub async fn edit_file(workspace: &Workspace, args: &EditFileArgs) -> Result<String, ToolError> {
    if args.old_text.is_empty() {
        return Err(ToolError::Validation("oldText must not be empty".to_string()));
    }

    let resolved = workspace.resolve_existing(&args.file_path)?;
    let current = tokio::fs::read_to_string(&resolved).await?;

    let occurrences = current.match_indices(&args.old_text).count();
    if occurrences != 1 {
        return Err(ToolError::Validation(format!(
            "edit_file requires exactly one match; found {}",
            occurrences
        )));
    }

    tokio::fs::write(&resolved, current.replacen(&args.old_text, &args.new_text, 1)).await?;
    Ok(format!("Updated {}", workspace.display(&resolved)))
}

pub async fn list_files(workspace: &Workspace, args: &ListFilesArgs) -> Result<String, ToolError> {
    let dir = workspace.resolve_existing(args.dir_path.as_deref().unwrap_or("."))?;
    if !dir.is_dir() {
        return Err(ToolError::Validation(format!(
            "{} is not a directory",
            workspace.display(&dir)
        )));
    }

    let recursive = args.recursive;
    let mut entries = blocking(move || Ok(walk(&dir, recursive))).await?;
    entries.sort();

    let total = entries.len();
    let mut lines: Vec<String> = entries
        .into_iter()
        .take(LIST_MAX_ENTRIES)
        .map(|(path, is_dir)| {
            let shown = workspace.display(&path);
            if is_dir {
                format!("{}/", shown)
            } else {
                shown
            }
        })
        .collect();

    if lines.is_empty() {
        return Ok("(empty directory)".to_string());
    }
    if total > LIST_MAX_ENTRIES {
        lines.push(format!("[{} more entries not shown]", total - LIST_MAX_ENTRIES));
    }
    Ok(lines.join("\n"))
}

/// Run directory walks off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ToolError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Internal(format!("Directory walk failed: {}", e)))?
}

/// Everything below `dir` as `(path, is_dir)`, pruning VCS and build
/// directories. Unreadable entries are skipped.
fn walk(dir: &Path, recursive: bool) -> Vec<(PathBuf, bool)> {
    let mut builder = WalkBuilder::new(dir);
    builder
        .hidden(false)
        .git_ignore(true)
        .max_depth(if recursive { None } else { Some(1) })
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_some_and(|t| t.is_dir())
                || !is_skipped(entry.path())
        });

    let mut entries = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.depth() == 0 {
            continue;
        }
        let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
        entries.push((entry.into_path(), is_dir));
    }
    entries
}

fn is_skipped(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(|name| SKIPPED_DIRS.contains(&name))
        .unwrap_or(false)
}

/// Every regular file under `dir`, skipping VCS and build directories.
/// Walks the disk synchronously.
pub(crate) fn collect_files(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walk(dir, recursive)
        .into_iter()
        .filter(|(_, is_dir)| !is_dir)
        .map(|(path, _)| path)
        .collect();
    files.sort();
    files
}

/// A compiled `filePattern`. `{a,b}` alternatives become one glob each.
#[derive(Debug, Clone)]
struct FileFilter {
    patterns: Vec<Pattern>,
}

impl FileFilter {
    fn new(pattern: &str) -> Result<Self, ToolError> {
        let patterns = expand_braces(pattern)
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ToolError::Validation(format!("Invalid file pattern {}: {}", pattern, e)))?;
        Ok(Self { patterns })
    }

    /// Matches either the path relative to the search root or the bare
    /// file name.
    fn matches(&self, relative: &Path) -> bool {
        let name = relative.file_name().and_then(|n| n.to_str());
        self.patterns
            .iter()
            .any(|p| p.matches_path(relative) || name.is_some_and(|n| p.matches(n)))
    }
}

fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };

    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{}{}{}", head, alt, tail)))
        .collect()
}

pub async fn search_files(workspace: &Workspace, args: &SearchFilesArgs) -> Result<String, ToolError> {
    let regex = Regex::new(&args.pattern)
        .map_err(|e| ToolError::Validation(format!("Invalid search pattern: {}", e)))?;
    let filter = args.file_pattern.as_deref().map(FileFilter::new).transpose()?;
    let dir = workspace.resolve_existing(args.directory.as_deref().unwrap_or("."))?;

    let shown = workspace.clone();
    let (mut matches, truncated) =
        blocking(move || Ok(search_dir(&shown, &dir, &regex, filter.as_ref()))).await?;

    if matches.is_empty() {
        return Ok(format!("No matches for \"{}\"", args.pattern));
    }
    if truncated {
        matches.push(format!("[stopped after {} matches]", SEARCH_MAX_MATCHES));
    }
    Ok(matches.join("\n"))
}

/// Matching lines as `path:line: text`, plus whether the cap was hit.
fn search_dir(
    workspace: &Workspace,
    dir: &Path,
    regex: &Regex,
    filter: Option<&FileFilter>,
) -> (Vec<String>, bool) {
    let mut matches = Vec::new();

    for path in collect_files(dir, true) {
        if let Some(filter) = filter {
            if !filter.matches(path.strip_prefix(dir).unwrap_or(&path)) {
                continue;
            }
        }
        // Binary and non-UTF-8 files are skipped.
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => continue,
        };

        for (number, line) in text.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if matches.len() == SEARCH_MAX_MATCHES {
                return (matches, true);
            }
            matches.push(format!(
                "{}:{}: {}",
                workspace.display(&path),
                number + 1,
                super::truncate_chars(line.trim(), SEARCH_LINE_MAX_CHARS)
            ));
        }
    }

    (matches, false)
}
