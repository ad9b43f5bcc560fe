//! Username templates.
//!
//! Supported placeholders: `{{display_name}}`, `{{role_name}}`,
//! `{{random N}}` (N alphanumeric characters) and `{{unix_time}}`.

use super::types::UsernameMetadata;
use crate::errors::{Result, WardenError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

pub const DEFAULT_TEMPLATE: &str = "v-{{display_name}}-{{role_name}}-{{random 20}}-{{unix_time}}";
pub const DEFAULT_MAX_LENGTH: usize = 63;
const MAX_RANDOM: usize = 128;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([a-z_]+)(?:\s+(\d+))?\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    DisplayName,
    RoleName,
    Random(usize),
    UnixTime,
}

/// Parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameTemplate {
    parts: Vec<Part>,
    max_length: usize,
}

impl Default for UsernameTemplate {
    fn default() -> Self {
        // The default template only uses known placeholders
        Self::parse(DEFAULT_TEMPLATE, DEFAULT_MAX_LENGTH).unwrap_or(Self {
            parts: vec![Part::Literal("v-".into()), Part::Random(20)],
            max_length: DEFAULT_MAX_LENGTH,
        })
    }
}

impl UsernameTemplate {
    /// `max_length` of zero means unbounded
    pub fn parse(template: &str, max_length: usize) -> Result<Self> {
        if template.trim().is_empty() {
            return Err(WardenError::invalid_configuration("username template is empty"));
        }

        let mut parts = Vec::new();
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = captures.get(0) else { continue };
            if whole.start() > last {
                parts.push(Part::Literal(template[last..whole.start()].to_string()));
            }
            last = whole.end();

            let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let argument = captures.get(2).map(|m| m.as_str());
            let part = match (name, argument) {
                ("display_name", None) => Part::DisplayName,
                ("role_name", None) => Part::RoleName,
                ("unix_time", None) => Part::UnixTime,
                ("random", Some(n)) => {
                    let n: usize = n.parse().unwrap_or(0);
                    if n == 0 || n > MAX_RANDOM {
                        return Err(WardenError::invalid_configuration(format!(
                            "random length must be between 1 and {}",
                            MAX_RANDOM
                        )));
                    }
                    Part::Random(n)
                }
                _ => {
                    return Err(WardenError::invalid_configuration(format!(
                        "unknown username template placeholder '{}'",
                        whole.as_str()
                    )))
                }
            };
            parts.push(part);
        }
        if last < template.len() {
            parts.push(Part::Literal(template[last..].to_string()));
        }

        if parts.iter().any(|p| matches!(p, Part::Literal(l) if l.contains("{{"))) {
            return Err(WardenError::invalid_configuration("unterminated placeholder in username template"));
        }

        Ok(Self { parts, max_length })
    }

    /// Render a username. Display and role names are reduced to
    /// `[A-Za-z0-9_-]`; the result is truncated to at most the maximum
    /// length in bytes, never inside a character.
    pub fn render(&self, metadata: &UsernameMetadata, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(literal) => out.push_str(literal),
                Part::DisplayName => out.push_str(&sanitize(&metadata.display_name)),
                Part::RoleName => out.push_str(&sanitize(&metadata.role_name)),
                Part::UnixTime => out.push_str(&now.timestamp().to_string()),
                Part::Random(n) => {
                    let random: String =
                        rand::thread_rng().sample_iter(&Alphanumeric).take(*n).map(char::from).collect();
                    out.push_str(&random);
                }
            }
        }

        if self.max_length > 0 && out.len() > self.max_length {
            let mut cut = self.max_length;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
        }
        out
    }
}

fn sanitize(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_').collect()
}
