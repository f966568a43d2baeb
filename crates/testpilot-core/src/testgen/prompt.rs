use super::artifact::Framework;
use super::classify::Guidance;
use crate::similarity::Neighbor;
use std::fmt::Write;

const NEIGHBOR_MAX_CHARS: usize = 2_000;
const ERROR_MAX_CHARS: usize = 4_000;

pub struct PromptInput<'a> {
    pub source_name: &'a str,
    pub source: &'a str,
    pub package: &'a str,
    pub framework: Framework,
    pub coverage_target: Option<u8>,
    pub neighbors: &'a [Neighbor],
}

fn clip(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn framework_rules(framework: Framework) -> &'static str {
    match framework {
        Framework::Testing => "Use only the standard library \"testing\" package.",
        Framework::Testify => {
            "Use github.com/stretchr/testify/assert (and require where a failure must stop the test)."
        }
    }
}

/// First-attempt prompt.
pub fn generation_prompt(input: &PromptInput<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Write Go unit tests for the file {} in package {}.",
        input.source_name, input.package
    );
    let _ = writeln!(prompt, "{}", framework_rules(input.framework));
    if let Some(target) = input.coverage_target {
        let _ = writeln!(prompt, "Aim for at least {}% statement coverage.", target);
    }
    let _ = writeln!(
        prompt,
        "Reply with a single Go file in one ```go block. Do not test unexported helpers \
         through reflection and do not redeclare anything from the package."
    );

    let _ = writeln!(prompt, "\nSource file {}:\n```go\n{}\n```", input.source_name, input.source);

    if !input.neighbors.is_empty() {
        let _ = writeln!(prompt, "\nRelated code from the same codebase, most similar first:");
        for neighbor in input.neighbors {
            let _ = writeln!(
                prompt,
                "\n// {}\n```go\n{}\n```",
                neighbor.source_location,
                clip(&neighbor.content, NEIGHBOR_MAX_CHARS)
            );
        }
    }

    prompt
}

/// Regeneration prompt: the original request plus the failure and the
/// category-specific repair instruction.
pub fn repair_prompt(
    input: &PromptInput<'_>,
    previous_artifact: &str,
    error_text: &str,
    guidance: Guidance,
) -> String {
    let mut prompt = generation_prompt(input);
    let _ = writeln!(
        prompt,
        "\nYour previous test file:\n```go\n{}\n```",
        previous_artifact
    );
    let _ = writeln!(
        prompt,
        "\nIt failed with:\n```\n{}\n```",
        clip(error_text, ERROR_MAX_CHARS)
    );
    let _ = writeln!(prompt, "\n{}", guidance.instruction());
    prompt
}
