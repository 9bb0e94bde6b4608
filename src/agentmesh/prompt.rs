//! System-prompt assembly.
//!
//! Builds mode-specific system prompts by template substitution. Recognized
//! placeholders: `{{current_date}}`, `{{current_time}}`,
//! `{{prompts_section}}`, `{{resources_section}}`,
//! `{{virtual_tools_section}}`. Two template families exist: a general one
//! for the simple agent and orchestrator sub-agents, and a ReAct one that
//! mandates the reasoning prelude and the `Final Answer:` sentinel.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use crate::agentmesh::mcp::{PromptInfo, ResourceInfo};

const GENERAL_TEMPLATE: &str = "\
You are a capable assistant that accomplishes user objectives by calling the \
tools made available to you. Today's date is {{current_date}} and the current \
time is {{current_time}}.

Call tools whenever they help; answer directly once you have what you need.
{{prompts_section}}{{resources_section}}{{virtual_tools_section}}";

const REACT_TEMPLATE: &str = "\
You are a reasoning assistant that accomplishes user objectives by \
interleaving explicit reasoning with tool use. Today's date is \
{{current_date}} and the current time is {{current_time}}.

Think step by step. For every turn, first write your reasoning, then either \
call a tool or finish. Only when the objective is fully \
accomplished, end your reply with a line of the form:

Final Answer: <your answer>
{{prompts_section}}{{resources_section}}{{virtual_tools_section}}";

const VIRTUAL_TOOLS_SECTION: &str = "\n\
Oversized tool outputs are written to disk and replaced by an envelope \
{\"spilled\": true, \"path\": ...}. Use read_large_output, \
search_large_output, and query_large_output to work with them.\n";

/// Which template family to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Plain tool-use prompt.
    General,
    /// Reasoning prelude + Final-Answer sentinel.
    React,
}

/// Builder for the session system prompt.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    mode: PromptMode,
    prompts: Vec<(String, PromptInfo)>,
    resources: Vec<(String, ResourceInfo)>,
    include_virtual_tools: bool,
    extra_instructions: Option<String>,
}

impl PromptAssembler {
    /// Start a prompt for the given mode.
    pub fn new(mode: PromptMode) -> Self {
        Self {
            mode,
            prompts: Vec::new(),
            resources: Vec::new(),
            include_virtual_tools: false,
            extra_instructions: None,
        }
    }

    /// Add a server's prompts to the index section.
    pub fn with_prompts(mut self, server_id: &str, prompts: &[PromptInfo]) -> Self {
        for prompt in prompts {
            self.prompts.push((server_id.to_string(), prompt.clone()));
        }
        self
    }

    /// Add a server's resources to the index section.
    pub fn with_resources(mut self, server_id: &str, resources: &[ResourceInfo]) -> Self {
        for resource in resources {
            self.resources
                .push((server_id.to_string(), resource.clone()));
        }
        self
    }

    /// Include the virtual-tools section describing spill handling.
    pub fn with_virtual_tools(mut self) -> Self {
        self.include_virtual_tools = true;
        self
    }

    /// Append caller-supplied instructions (e.g. orchestrator template
    /// variables) at the end of the prompt.
    pub fn with_extra_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.extra_instructions = Some(instructions.into());
        self
    }

    fn prompts_section(&self) -> String {
        if self.prompts.is_empty() {
            return String::new();
        }
        let mut section = String::from("\nPrompts available via get_prompt(server, name):\n");
        for (server, prompt) in &self.prompts {
            section.push_str(&format!(
                "- {}/{}: {}\n",
                server, prompt.name, prompt.description
            ));
        }
        section
    }

    fn resources_section(&self) -> String {
        if self.resources.is_empty() {
            return String::new();
        }
        let mut section = String::from("\nResources available via get_resource(server, uri):\n");
        for (server, resource) in &self.resources {
            section.push_str(&format!("- {} {} ({})\n", server, resource.uri, resource.name));
        }
        section
    }

    /// Render the final system prompt with dated session metadata.
    pub fn render(&self) -> String {
        let template = match self.mode {
            PromptMode::General => GENERAL_TEMPLATE,
            PromptMode::React => REACT_TEMPLATE,
        };
        let now = Utc::now();
        let virtual_tools = if self.include_virtual_tools {
            VIRTUAL_TOOLS_SECTION
        } else {
            ""
        };

        let mut rendered = template
            .replace("{{current_date}}", &now.format("%Y-%m-%d").to_string())
            .replace("{{current_time}}", &now.format("%H:%M UTC").to_string())
            .replace("{{prompts_section}}", &self.prompts_section())
            .replace("{{resources_section}}", &self.resources_section())
            .replace("{{virtual_tools_section}}", virtual_tools);

        if let Some(extra) = &self.extra_instructions {
            rendered.push('\n');
            rendered.push_str(extra);
        }
        rendered
    }
}

lazy_static! {
    /// Case-insensitive `Final Answer:` sentinel, anchored to a line start so
    /// mid-sentence mentions do not terminate the loop.
    static ref FINAL_ANSWER_RE: Regex =
        Regex::new(r"(?im)^\s*final answer:\s*(?P<answer>.*)$").expect("sentinel regex");
}

/// Extract the ReAct final answer, if the sentinel is present.
///
/// Everything after the sentinel — including subsequent lines — is the
/// answer.
pub fn extract_final_answer(text: &str) -> Option<String> {
    let captures = FINAL_ANSWER_RE.captures(text)?;
    let sentinel_match = captures.name("answer")?;
    let answer = &text[sentinel_match.start()..];
    Some(answer.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_template_substitutes_date() {
        let prompt = PromptAssembler::new(PromptMode::General).render();
        assert!(!prompt.contains("{{current_date}}"));
        assert!(!prompt.contains("{{prompts_section}}"));
    }

    #[test]
    fn test_react_template_has_sentinel_instruction() {
        let prompt = PromptAssembler::new(PromptMode::React).render();
        assert!(prompt.contains("Final Answer:"));
        assert!(prompt.contains("step by step"));
    }

    #[test]
    fn test_prompts_and_resources_sections() {
        let prompt = PromptAssembler::new(PromptMode::General)
            .with_prompts(
                "docs",
                &[PromptInfo {
                    name: "summarize".to_string(),
                    description: "Summarize a document".to_string(),
                }],
            )
            .with_resources(
                "docs",
                &[ResourceInfo {
                    uri: "docs://guide".to_string(),
                    name: "Guide".to_string(),
                    mime_type: None,
                }],
            )
            .with_virtual_tools()
            .render();
        assert!(prompt.contains("docs/summarize"));
        assert!(prompt.contains("docs://guide"));
        assert!(prompt.contains("read_large_output"));
    }

    #[test]
    fn test_extract_final_answer_variants() {
        assert_eq!(
            extract_final_answer("Reasoning...\nFinal Answer: 42").as_deref(),
            Some("42")
        );
        assert_eq!(
            extract_final_answer("FINAL ANSWER: done").as_deref(),
            Some("done")
        );
        assert_eq!(
            extract_final_answer("final answer:   spaced  ").as_deref(),
            Some("spaced")
        );
        assert!(extract_final_answer("no sentinel here").is_none());
    }

    #[test]
    fn test_multiline_answer_is_preserved() {
        let text = "thinking\nFinal Answer: first line\nsecond line";
        assert_eq!(
            extract_final_answer(text).as_deref(),
            Some("first line\nsecond line")
        );
    }

    #[test]
    fn test_mid_sentence_mention_is_ignored() {
        assert!(extract_final_answer("I will give the final answer: later").is_none());
    }
}
