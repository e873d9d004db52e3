//! Prompt templates
//!
//! Renders user variables into a prompt and pulls the model's answer back
//! out of the decoded output.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::request::ConfigError;

/// Name of the pass-through template
pub const NONE_TEMPLATE: &str = "None";

static VARIABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
});

/// A prompt template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    /// Template with `{variable}` placeholders
    pub prompt_input: String,
    /// Shorter form used when every variable it omits is empty
    #[serde(default)]
    pub prompt_no_input: Option<String>,
    /// Marker after which the model's answer begins
    #[serde(default)]
    pub response_split: Option<String>,
}

impl PromptTemplate {
    pub fn alpaca() -> Self {
        Self {
            name: "alpaca".to_string(),
            prompt_input: "Below is an instruction that describes a task, paired with an input \
                that provides further context. Write a response that appropriately completes \
                the request.\n\n### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n\
                ### Response:\n"
                .to_string(),
            prompt_no_input: Some(
                "Below is an instruction that describes a task. Write a response that \
                appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n\
                ### Response:\n"
                    .to_string(),
            ),
            response_split: Some("### Response:".to_string()),
        }
    }

    pub fn alpaca_short() -> Self {
        Self {
            name: "alpaca_short".to_string(),
            prompt_input:
                "### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n"
                    .to_string(),
            prompt_no_input: Some("### Instruction:\n{instruction}\n\n### Response:\n".to_string()),
            response_split: Some("### Response:".to_string()),
        }
    }

    /// Passes the first variable through unchanged
    pub fn none() -> Self {
        Self {
            name: NONE_TEMPLATE.to_string(),
            prompt_input: "{prompt}".to_string(),
            prompt_no_input: None,
            response_split: None,
        }
    }
}

/// Renders prompts for one template
#[derive(Debug, Clone, PartialEq)]
pub struct Prompter {
    template: PromptTemplate,
    variable_names: Vec<String>,
}

impl Prompter {
    pub fn new(template: PromptTemplate) -> Self {
        let variable_names = placeholders(&template.prompt_input);
        Self {
            template,
            variable_names,
        }
    }

    pub fn template_name(&self) -> &str {
        &self.template.name
    }

    /// Placeholder names in the order they first appear
    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    /// Input labels, e.g. `some_var` becomes `"Some Var"`
    pub fn variable_labels(&self) -> Vec<String> {
        self.variable_names.iter().map(|name| label(name)).collect()
    }

    /// Fills the template; `variables` pair up with [`Self::variable_names`]
    /// by position, missing ones render as empty strings.
    pub fn generate_prompt(&self, variables: &[String]) -> String {
        let values: BTreeMap<&str, &str> = self
            .variable_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = variables.get(i).map(String::as_str).unwrap_or("");
                (name.as_str(), value)
            })
            .collect();

        let template = match &self.template.prompt_no_input {
            Some(short) if omitted_are_empty(short, &values) => short,
            _ => &self.template.prompt_input,
        };

        VARIABLE_PATTERN
            .replace_all(template, |caps: &regex::Captures| {
                values.get(&caps[1]).copied().unwrap_or("").to_string()
            })
            .into_owned()
    }

    /// Extracts the answer from a decoded sequence that echoes the prompt
    pub fn get_response(&self, output: &str) -> String {
        match &self.template.response_split {
            Some(split) => match output.split(split.as_str()).nth(1) {
                Some(response) => response.trim().to_string(),
                None => output.to_string(),
            },
            None => output.to_string(),
        }
    }
}

/// Registry of the templates offered by the panel
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, PromptTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            templates: BTreeMap::new(),
        };
        registry.register(PromptTemplate::alpaca());
        registry.register(PromptTemplate::alpaca_short());
        registry
    }

    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Template names, sorted, followed by `"None"`
    pub fn available_template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.push(NONE_TEMPLATE.to_string());
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        name == NONE_TEMPLATE || self.templates.contains_key(name)
    }

    pub fn prompter(&self, name: &str) -> Result<Prompter, ConfigError> {
        if name == NONE_TEMPLATE {
            return Ok(Prompter::new(PromptTemplate::none()));
        }
        self.templates
            .get(name)
            .cloned()
            .map(Prompter::new)
            .ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))
    }

    /// Renders a prompt in one call
    pub fn render(&self, template_id: &str, variables: &[String]) -> Result<String, ConfigError> {
        Ok(self.prompter(template_id)?.generate_prompt(variables))
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in VARIABLE_PATTERN.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn label(name: &str) -> String {
    name.split('_').map(capitalize).collect::<Vec<_>>().join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn omitted_are_empty(short: &str, values: &BTreeMap<&str, &str>) -> bool {
    let kept = placeholders(short);
    values
        .iter()
        .all(|(name, value)| kept.iter().any(|k| k == name) || value.trim().is_empty())
}
