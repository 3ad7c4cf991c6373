//! Parsing of coordinator decisions and evaluator verdicts from agent text.

use std::sync::OnceLock;

use regex::Regex;

use super::cycle::TaskType;

/// What the coordinator asked for
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub task_type: TaskType,
    pub description: String,
    /// The `<task>` block if present, otherwise the description
    pub task_xml: String,
    pub files: Vec<String>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"\b(EVOLVE|CLEANUP|BUGFIX|DONE):[ \t]*").expect("valid tag regex"))
}

fn blank_line_regex() -> &'static Regex {
    static BLANK: OnceLock<Regex> = OnceLock::new();
    BLANK.get_or_init(|| Regex::new(r"\n[ \t]*\n").expect("valid blank line regex"))
}

fn block_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("valid block regex")
}

fn task_regex() -> &'static Regex {
    static TASK: OnceLock<Regex> = OnceLock::new();
    TASK.get_or_init(|| Regex::new(r"(?s)<task>.*?</task>").expect("valid task regex"))
}

fn files_regex() -> &'static Regex {
    static FILES: OnceLock<Regex> = OnceLock::new();
    FILES.get_or_init(|| block_regex("files"))
}

fn skills_regex() -> &'static Regex {
    static SKILLS: OnceLock<Regex> = OnceLock::new();
    SKILLS.get_or_init(|| block_regex("skills"))
}

fn verdict_regex() -> &'static Regex {
    static VERDICT: OnceLock<Regex> = OnceLock::new();
    VERDICT.get_or_init(|| Regex::new(r"\b(PASSED|FAILED)\b").expect("valid verdict regex"))
}

/// The decision with the highest-priority tag that carries a description.
///
/// Tags rank EVOLVE, CLEANUP, BUGFIX, DONE regardless of where they appear,
/// so a passing mention of DONE never outranks a real task.
pub fn parse_decision(output: &str) -> Option<Decision> {
    let (task_type, description) = TaskType::ALL
        .into_iter()
        .find_map(|task_type| tagged_description(output, task_type).map(|d| (task_type, d)))?;

    let task_xml = task_regex()
        .find(output)
        .map_or_else(|| description.to_string(), |m| m.as_str().to_string());
    let files = files_regex()
        .captures(&task_xml)
        .and_then(|c| c.get(1))
        .map(|m| split_list(m.as_str(), '\n'))
        .unwrap_or_default();
    let skills = skills_regex()
        .captures(&task_xml)
        .and_then(|c| c.get(1))
        .map(|m| split_list(m.as_str(), ','))
        .unwrap_or_default();

    Some(Decision {
        task_type,
        description: description.to_string(),
        task_xml,
        files,
        skills,
    })
}

/// Text after the first `TYPE:` tag with a non-empty description, up to the next blank line
fn tagged_description(output: &str, task_type: TaskType) -> Option<&str> {
    tag_regex()
        .captures_iter(output)
        .filter(|caps| caps.get(1).and_then(|tag| TaskType::from_tag(tag.as_str())) == Some(task_type))
        .filter_map(|caps| caps.get(0))
        .find_map(|whole| {
            let rest = &output[whole.end()..];
            let end = blank_line_regex().find(rest).map_or(rest.len(), |m| m.start());
            let description = rest[..end].trim();
            (!description.is_empty()).then_some(description)
        })
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// The last verdict token wins, so a summary can follow earlier discussion
pub fn parse_verdict(output: &str) -> Option<Verdict> {
    verdict_regex()
        .find_iter(output)
        .last()
        .map(|m| match m.as_str() {
            "PASSED" => Verdict::Passed,
            _ => Verdict::Failed,
        })
}
