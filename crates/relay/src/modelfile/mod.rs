//! Per-request configuration compiled from a directive list.
//!
//! A modelfile arrives on the wire as an ordered list of `{name, args}`
//! directives. Compilation is forgiving: a malformed or unknown directive is
//! logged and skipped, never failing the whole request.

pub mod script;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::ChatMessage;
pub use script::{Instruction, Script, ScriptSyntaxError};

/// Bot called when a script compiles to zero bot calls and the modelfile
/// names no collaborator to fall back on.
pub const DEFAULT_BOT: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub name: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("directive {0:?} expects two arguments")]
    MissingArgument(String),
}

/// A parameter value with the coercion the directive language applies:
/// integer first, then float, then the `true`/`false`/`none` literals,
/// falling back to the raw string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Str(String),
}

impl ParamValue {
    pub fn coerce(raw: &str) -> ParamValue {
        if let Ok(i) = raw.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return ParamValue::Float(f);
        }
        match raw.to_lowercase().as_str() {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            "none" => ParamValue::None,
            _ => ParamValue::Str(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Result of [`ParameterDict::lookup_or_namespace`].
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    Value(&'a ParamValue),
    Namespace(ParameterDict),
}

/// Parameter map with an explicit namespace fallback: looking up a missing
/// key yields the sub-map of entries sharing that key as a prefix, with the
/// prefix stripped. Parameters are grouped by namespace this way, e.g.
/// `agent_show_step_log` lives in the `agent_` namespace as `show_step_log`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterDict {
    entries: HashMap<String, ParamValue>,
}

impl ParameterDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, value: ParamValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sub-map of all entries whose key starts with `prefix`, stripped of it.
    pub fn namespace(&self, prefix: &str) -> ParameterDict {
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();
        ParameterDict { entries }
    }

    /// Exact match first, namespace sub-map on a miss.
    pub fn lookup_or_namespace(&self, key: &str) -> Lookup<'_> {
        match self.entries.get(key) {
            Some(value) => Lookup::Value(value),
            None => Lookup::Namespace(self.namespace(key)),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(ParamValue::as_bool).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(ParamValue::as_i64).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }
}

/// Strip a single/double/triple-quote envelope from a directive argument.
///
/// Embedded quotes of a different kind survive; unquoted text is returned
/// trimmed, as-is.
pub fn extract_quoted(text: &str) -> &str {
    let text = text.trim();
    if text.len() >= 6 && text.starts_with("\"\"\"") && text.ends_with("\"\"\"") {
        return &text[3..text.len() - 3];
    }
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

/// Immutable compiled configuration for one request.
#[derive(Debug, Clone, Default)]
pub struct Modelfile {
    pub override_system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub template: String,
    pub before_prompt: String,
    pub after_prompt: String,
    pub input_bot: Option<String>,
    pub input_prefix: String,
    pub input_suffix: String,
    pub process_bot: Option<String>,
    pub output_bot: Option<String>,
    pub output_prefix: String,
    pub output_suffix: String,
    pub script: Script,
    pub parameters: ParameterDict,
}

impl Modelfile {
    /// Compile a directive list. Bad directives are logged and skipped.
    pub fn from_directives(directives: &[Directive]) -> Modelfile {
        let mut modelfile = Modelfile::default();
        for directive in directives {
            if let Err(e) = modelfile.apply(directive) {
                tracing::warn!("skipping modelfile directive {:?}: {}", directive.name, e);
            }
        }
        modelfile
    }

    pub fn from_json(raw: &str) -> Modelfile {
        let directives: Vec<Directive> = match serde_json::from_str(raw) {
            Ok(directives) => directives,
            Err(e) => {
                tracing::warn!("unparseable modelfile source, using defaults: {}", e);
                Vec::new()
            }
        };
        Modelfile::from_directives(&directives)
    }

    fn apply(&mut self, directive: &Directive) -> Result<(), DirectiveError> {
        // A '#' starts a comment: in the name it voids the whole directive,
        // in the args it truncates them.
        let args = if directive.name.contains('#') {
            ""
        } else {
            directive.args.as_str()
        };
        let args = args.split('#').next().unwrap_or_default();

        match directive.name.as_str() {
            "template" => self.template = extract_quoted(args).to_string(),
            "system" => self.override_system_prompt.push_str(extract_quoted(args)),
            "before-prompt" => self.before_prompt.push_str(extract_quoted(args)),
            "after-prompt" => self.after_prompt.push_str(extract_quoted(args)),
            "input-prefix" => self.input_prefix.push_str(extract_quoted(args)),
            "input-suffix" => self.input_suffix.push_str(extract_quoted(args)),
            "output-prefix" => self.output_prefix.push_str(extract_quoted(args)),
            "output-suffix" => self.output_suffix.push_str(extract_quoted(args)),

            "message" => {
                let (role, content) = args
                    .split_once(' ')
                    .ok_or_else(|| DirectiveError::MissingArgument("message".into()))?;
                let role = extract_quoted(role);
                let content = extract_quoted(content);
                match role {
                    "user" => self.messages.push(ChatMessage::user(content)),
                    "assistant" => self.messages.push(ChatMessage::assistant(content)),
                    "system" => self.override_system_prompt.push_str(content),
                    other => tracing::debug!("ignoring message with unknown role {:?}", other),
                }
            }

            "parameter" => {
                let (key, value) = args
                    .split_once(' ')
                    .ok_or_else(|| DirectiveError::MissingArgument("parameter".into()))?;
                let key = extract_quoted(key);
                let value = extract_quoted(value);
                self.parameters.insert(key, ParamValue::coerce(value));
            }

            "input-bot" => self.input_bot = Some(extract_quoted(args).to_string()),
            "output-bot" => self.output_bot = Some(extract_quoted(args).to_string()),
            "from" | "process-bot" => self.process_bot = Some(extract_quoted(args).to_string()),

            "script" => {
                self.script = match Script::parse(extract_quoted(args)) {
                    Ok(script) => script,
                    Err(e) => {
                        tracing::warn!("script failed validation, using default: {}", e);
                        Script::default()
                    }
                }
            }

            other => return Err(DirectiveError::UnknownDirective(other.to_string())),
        }
        Ok(())
    }

    /// True when no collaborator bot is named at all; such a modelfile has
    /// nothing the flow interpreter could call.
    pub fn has_no_bots(&self) -> bool {
        self.input_bot.is_none() && self.process_bot.is_none() && self.output_bot.is_none()
    }

    /// The bot substituted when a script compiles to zero bot calls.
    pub fn fallback_bot(&self) -> &str {
        self.process_bot
            .as_deref()
            .or(self.input_bot.as_deref())
            .or(self.output_bot.as_deref())
            .unwrap_or(DEFAULT_BOT)
    }

    /// Compile the script into an executable instruction list, falling back
    /// to the default script when compilation rejects it.
    pub fn instructions(&self) -> Vec<Instruction> {
        match self.script.compile(self) {
            Ok(instructions) => instructions,
            Err(e) => {
                tracing::warn!("script failed to compile, using default: {}", e);
                Script::default()
                    .compile(self)
                    .expect("default script always compiles")
            }
        }
    }
}
