//! Rule line encoding
//!
//! A rule occupies exactly one line of the rule file:
//!
//! ```text
//! <name> = "<body>"
//! ```
//!
//! The body is quoted as a JSON string literal, which is also a valid Rego
//! string, so quotes, backslashes and newlines inside it are escaped and can
//! never be misread as the start of another rule.

use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// A named, opaque policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule name (identity)
    pub name: String,
    /// Rule text, passed through to the policy engine untouched
    #[serde(alias = "rule")]
    pub body: String,
}

impl PolicyRule {
    /// Create a new rule
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// Check that the rule encodes onto a single well-formed line
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)
    }

    /// Encode as a line to append to the rule file, including the leading newline
    pub(crate) fn encode(&self) -> String {
        let quoted = serde_json::Value::String(self.body.clone());
        format!("\n{} = {}", self.name, quoted)
    }
}

/// Names must be non-empty and must not contain whitespace, `=` or `"`.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::MalformedRule {
            message: "rule name must not be empty".to_string(),
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == '=' || *c == '"')
    {
        return Err(StoreError::MalformedRule {
            message: format!("rule name {name:?} contains forbidden character {c:?}"),
        });
    }
    Ok(())
}

/// Parse one rule line. Lines that are not `name = "body"` yield `None`.
pub(crate) fn parse_line(line: &str) -> Option<PolicyRule> {
    let (lhs, rhs) = line.split_once('=')?;
    let name = lhs.trim();
    validate_name(name).ok()?;

    let body: String = serde_json::from_str(rhs.trim()).ok()?;
    Some(PolicyRule::new(name, body))
}

/// Whether any line of `content` assigns to `name`.
pub(crate) fn defines(content: &[u8], name: &str) -> bool {
    String::from_utf8_lossy(content).lines().any(|line| {
        line.split_once('=')
            .map(|(lhs, _)| lhs.trim() == name)
            .unwrap_or(false)
    })
}

/// Byte-wise substring test. `needle` must be non-empty.
pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
