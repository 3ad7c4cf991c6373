use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::AgentType;
use crate::error::{Error, Result};

const DEFAULT_COORDINATOR: &str = r#"You are the coordinator of an autonomous improvement loop for this project.

## Project
{{PROJECT}}

## Current State
{{STATE}}

## Recent Cycles
{{LOG}}
{{INJECTED_GUIDANCE}}
Decide the single most valuable next step. Answer with exactly one line starting with
EVOLVE:, CLEANUP:, BUGFIX: or DONE: followed by a short description. For anything but
DONE, follow it with a blank line and a task block:

<task>
<files>
one path per line
</files>
<skills>comma, separated, skills</skills>
</task>
"#;

const DEFAULT_WORKER: &str = r#"You are a worker implementing one {{TASK_TYPE}} task in this project.

## Project
{{PROJECT}}

## Task
{{TASK_XML}}
{{FEEDBACK}}{{INJECTED_GUIDANCE}}
Make the change, keep the build green and commit your work when done.
"#;

const DEFAULT_EVALUATOR: &str = r#"You are reviewing the result of a {{TASK_TYPE}} task.

## Project
{{PROJECT}}

## Task
{{TASK_XML}}

## Worker Report
{{RESULT}}
{{INJECTED_GUIDANCE}}
Check the change carefully. End your answer with PASSED if it is correct and complete,
or FAILED followed by what must be fixed.
"#;

/// A prompt template and where it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub name: String,
    pub content: String,
    pub is_custom: bool,
}

/// Role prompt templates; files in the prompts directory override built-ins
pub struct PromptLibrary {
    prompts_dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
        }
    }

    fn role(name: &str) -> Result<AgentType> {
        AgentType::from_name(name).ok_or_else(|| Error::NotFound {
            kind: "prompt",
            id: name.to_string(),
        })
    }

    pub fn prompt_path(&self, name: &str) -> PathBuf {
        self.prompts_dir.join(format!("{}.md", name))
    }

    pub fn is_custom(&self, name: &str) -> bool {
        self.prompt_path(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<PromptTemplate> {
        let role = Self::role(name)?;
        let path = self.prompt_path(name);
        if path.exists() {
            return Ok(PromptTemplate {
                name: name.to_string(),
                content: std::fs::read_to_string(&path)?,
                is_custom: true,
            });
        }
        let content = match role {
            AgentType::Coordinator => DEFAULT_COORDINATOR,
            AgentType::Worker => DEFAULT_WORKER,
            AgentType::Evaluator => DEFAULT_EVALUATOR,
        };
        Ok(PromptTemplate {
            name: name.to_string(),
            content: content.to_string(),
            is_custom: false,
        })
    }

    pub fn list(&self) -> Result<Vec<PromptTemplate>> {
        AgentType::ALL.iter().map(|t| self.load(t.as_str())).collect()
    }

    /// Persist a custom template for a role
    pub fn save(&self, name: &str, content: &str) -> Result<()> {
        Self::role(name)?;
        std::fs::create_dir_all(&self.prompts_dir)?;
        std::fs::write(self.prompt_path(name), content)?;
        Ok(())
    }
}

/// Replace every `{{KEY}}` placeholder that has a value. Unused placeholders become empty.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{([A-Z_]+)\}\}").expect("valid placeholder regex"));
    placeholder
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Section text for `{{INJECTED_GUIDANCE}}`
pub fn guidance_section(guidance: Option<&str>) -> String {
    match guidance {
        Some(g) if !g.trim().is_empty() => format!("\n## Injected Guidance\n\n{}\n", g.trim()),
        _ => String::new(),
    }
}

/// Section text for `{{FEEDBACK}}` on a retried work phase
pub fn feedback_section(feedback: Option<&str>) -> String {
    match feedback {
        Some(f) if !f.trim().is_empty() => {
            format!("\n## Evaluator Feedback From The Previous Attempt\n\n{}\n", f.trim())
        }
        _ => String::new(),
    }
}

/// The log's header plus its last `max_entries` `## Cycle N:` entries
pub fn recent_log_entries(log: &str, max_entries: usize) -> String {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    let entry = ENTRY.get_or_init(|| Regex::new(r"(?m)^## Cycle \d+:").expect("valid log entry regex"));

    let starts: Vec<usize> = entry.find_iter(log).map(|m| m.start()).collect();
    if starts.len() <= max_entries {
        return log.to_string();
    }
    let header = &log[..starts[0]];
    let recent = &log[starts[starts.len() - max_entries]..];
    format!(
        "{}\n\n*[Showing last {} of {} cycles]*\n\n{}",
        header.trim_end(),
        max_entries,
        starts.len(),
        recent
    )
}
