use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a [`LogEvent`], least severe first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Verbose => "Verbose",
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        };
        f.write_str(s)
    }
}

/// One piece of a parsed message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "lowercase")]
pub enum TemplateToken {
    /// A `{Name}` or `{Name:format}` hole.
    Property {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        raw_text: String,
    },
    Text { text: String },
}

/// Splits a message template into literal text and property holes.
///
/// `{{` and `}}` stand for literal braces. A `{` without a matching `}` is kept as text.
pub fn parse_template(template: &str) -> Vec<TemplateToken> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("{{") || rest.starts_with("}}") {
            text.push(c);
            rest = &rest[2..];
            continue;
        }
        if c == '{' {
            if let Some(end) = rest.find('}') {
                let inner = &rest[1..end];
                if is_property(inner) {
                    if !text.is_empty() {
                        tokens.push(TemplateToken::Text { text: std::mem::take(&mut text) });
                    }
                    let (name, format) = match inner.split_once(':') {
                        Some((name, format)) => (name, Some(format.to_string())),
                        None => (inner, None),
                    };
                    tokens.push(TemplateToken::Property {
                        name: name.trim_start_matches(|c: char| c == '@' || c == '$').to_string(),
                        format,
                        raw_text: rest[..=end].to_string(),
                    });
                    rest = &rest[end + 1..];
                    continue;
                }
            }
        }
        text.push(c);
        rest = &rest[c.len_utf8()..];
    }
    if !text.is_empty() {
        tokens.push(TemplateToken::Text { text });
    }
    tokens
}

fn is_property(inner: &str) -> bool {
    let name = inner.split(':').next().unwrap_or("");
    let name = name.strip_prefix(|c: char| c == '@' || c == '$').unwrap_or(name);
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// A structured log entry as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message_template: String,
    #[serde(default)]
    pub tokens: Vec<TemplateToken>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl LogEvent {
    pub fn new(level: Level, message_template: &str) -> LogEvent {
        LogEvent {
            timestamp: Utc::now(),
            level,
            message_template: message_template.to_string(),
            tokens: parse_template(message_template),
            properties: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            exception: None,
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> LogEvent {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> LogEvent {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> LogEvent {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    /// The message with property values substituted. Holes without a value keep their
    /// raw text.
    pub fn render(&self) -> String {
        let parsed;
        let tokens = if self.tokens.is_empty() {
            parsed = parse_template(&self.message_template);
            &parsed
        } else {
            &self.tokens
        };

        let mut out = String::with_capacity(self.message_template.len());
        for token in tokens {
            match token {
                TemplateToken::Text { text } => out.push_str(text),
                TemplateToken::Property { name, raw_text, .. } => match self.properties.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => out.push_str(raw_text),
                },
            }
        }
        out
    }
}
