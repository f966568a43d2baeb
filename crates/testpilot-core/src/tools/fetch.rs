use super::shell::truncate_to_byte_limit;
use super::UrlExtractArgs;
use crate::error::{ServiceError, ToolError};
use regex::Regex;
use reqwest::Client;
use std::sync::OnceLock;

const SERVICE: &str = "URL fetch";
const MAX_CONTENT_BYTES: usize = 40 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Html,
}

impl Format {
    fn parse(name: &str) -> Result<Self, ToolError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" | "markdown" => Ok(Format::Text),
            "html" => Ok(Format::Html),
            other => Err(ToolError::Validation(format!(
                "Unsupported format '{}' (expected text or html)",
                other
            ))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Format::Text => "text",
            Format::Html => "html",
        }
    }
}

pub async fn url_extract(
    client: &Client,
    timeout_secs: u64,
    args: &UrlExtractArgs,
) -> Result<String, ToolError> {
    let url = args.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ToolError::Validation(format!(
            "Only http(s) URLs can be fetched: {}",
            url
        )));
    }

    let formats = requested_formats(&args.formats)?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ServiceError::from_reqwest(SERVICE, timeout_secs, e))?;

    if !response.status().is_success() {
        let status = response.status();
        return Err(ServiceError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body: status.canonical_reason().unwrap_or_default().to_string(),
        }
        .into());
    }

    let html = response
        .text()
        .await
        .map_err(|e| ServiceError::from_reqwest(SERVICE, timeout_secs, e))?;

    let render = |format: Format| match format {
        Format::Text => html_to_text(&html),
        Format::Html => html.clone(),
    };

    let content = if formats.len() == 1 {
        render(formats[0])
    } else {
        formats
            .iter()
            .map(|f| format!("## {}\n{}", f.label(), render(*f)))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    Ok(truncate_to_byte_limit(content, MAX_CONTENT_BYTES))
}

/// Requested formats in first-mention order without repeats; text when none.
fn requested_formats(names: &[String]) -> Result<Vec<Format>, ToolError> {
    let mut formats = Vec::new();
    for name in names {
        let format = Format::parse(name)?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    if formats.is_empty() {
        formats.push(Format::Text);
    }
    Ok(formats)
}

fn markup_regexes() -> &'static (Regex, Regex, Regex) {
    static CACHED: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    CACHED.get_or_init(|| {
        (
            Regex::new(r"(?is)<(script|style|noscript|head)\b.*?</(script|style|noscript|head)>")
                .expect("hidden-block regex must compile"),
            Regex::new(r"(?s)<[^>]*>").expect("tag regex must compile"),
            Regex::new(r"[ \t]*\n\s*").expect("line-break regex must compile"),
        )
    })
}

/// Strip markup and collapse blank runs into single line breaks.
pub(crate) fn html_to_text(html: &str) -> String {
    let (hidden, tags, breaks) = markup_regexes();
    let visible = hidden.replace_all(html, " ");
    let text = tags.replace_all(&visible, "\n");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let collapsed = breaks.replace_all(text.trim(), "\n");
    collapsed
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
