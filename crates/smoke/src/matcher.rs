//! Element matchers
//!
//! Scenarios address elements with the selector syntax the studio UI tests
//! have always used:
//!
//! - `text=Submit` matches any element whose text contains `Submit`
//! - `button ::-p-text('Continue')` matches text inside elements matching a CSS selector
//! - anything else is a plain CSS selector

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SmokeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Matcher {
    /// Plain CSS selector
    Css(String),
    /// Text anywhere on the page
    Text(String),
    /// Text inside elements matching `selector`
    TextWithin { selector: String, text: String },
}

fn text_within_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(?P<selector>.*?)\s*::-p-text\((?:'(?P<single>[^']*)'|"(?P<double>[^"]*)")\)$"#)
            .expect("text matcher pattern is valid")
    })
}

impl Matcher {
    pub fn css(selector: impl Into<String>) -> Self {
        Matcher::Css(selector.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Matcher::Text(text.into())
    }

    pub fn text_within(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Matcher::TextWithin {
            selector: selector.into(),
            text: text.into(),
        }
    }

    /// Parse a matcher from selector syntax
    pub fn parse(raw: &str) -> Result<Self, SmokeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SmokeError::Scenario("empty element matcher".to_string()));
        }

        if let Some(text) = raw.strip_prefix("text=") {
            if text.is_empty() {
                return Err(SmokeError::Scenario(format!("matcher '{}' has no text", raw)));
            }
            return Ok(Matcher::Text(text.to_string()));
        }

        if let Some(caps) = text_within_pattern().captures(raw) {
            let text = caps
                .name("single")
                .or_else(|| caps.name("double"))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let selector = caps
                .name("selector")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            return Ok(if selector.is_empty() {
                Matcher::Text(text)
            } else {
                Matcher::TextWithin { selector, text }
            });
        }

        if raw.contains("::-p-") {
            return Err(SmokeError::Scenario(format!("unsupported pseudo selector in '{}'", raw)));
        }

        Ok(Matcher::Css(raw.to_string()))
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Css(selector) => write!(f, "{}", selector),
            Matcher::Text(text) => write!(f, "text={}", text),
            Matcher::TextWithin { selector, text } => write!(f, "{} ::-p-text('{}')", selector, text),
        }
    }
}

impl FromStr for Matcher {
    type Err = SmokeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Matcher::parse(s)
    }
}

impl TryFrom<String> for Matcher {
    type Error = SmokeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Matcher::parse(&value)
    }
}

impl From<Matcher> for String {
    fn from(matcher: Matcher) -> Self {
        matcher.to_string()
    }
}
