//! Named password policies evaluated on the host.

use crate::errors::{Result, WardenError};
use crate::types::SecretString;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

/// Characters drawn from `charset`, at least `min_chars` of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CharsetRule {
    #[validate(length(min = 1, message = "charset must not be empty"))]
    pub charset: String,
    #[serde(default)]
    pub min_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PasswordPolicy {
    #[validate(range(min = 4, max = 256, message = "length must be between 4 and 256"))]
    pub length: usize,
    #[validate(length(min = 1, message = "at least one charset rule is required"), nested)]
    pub rules: Vec<CharsetRule>,
}

impl PasswordPolicy {
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        let required: usize = self.rules.iter().map(|r| r.min_chars).sum();
        if required > self.length {
            return Err(WardenError::validation_field(
                format!("rules require {} characters but length is {}", required, self.length),
                "rules",
            ));
        }
        Ok(())
    }

    /// Generate one password satisfying every rule
    pub fn generate(&self) -> Result<SecretString> {
        let alphabet: Vec<char> = self
            .rules
            .iter()
            .flat_map(|r| r.charset.chars())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if alphabet.is_empty() {
            return Err(WardenError::generation_failed("policy has no characters to draw from"));
        }

        let mut rng = rand::thread_rng();
        let mut out: Vec<char> = Vec::with_capacity(self.length);
        for rule in &self.rules {
            let charset: Vec<char> = rule.charset.chars().collect();
            for _ in 0..rule.min_chars {
                let c = charset
                    .get(rng.gen_range(0..charset.len().max(1)))
                    .copied()
                    .ok_or_else(|| WardenError::generation_failed("rule charset is empty"))?;
                out.push(c);
            }
        }
        if out.len() > self.length {
            return Err(WardenError::generation_failed("rules require more characters than the policy length"));
        }
        while out.len() < self.length {
            out.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        out.shuffle(&mut rng);

        let password: String = out.into_iter().collect();
        if !self.satisfied_by(&password) {
            return Err(WardenError::generation_failed("generated password does not satisfy the policy"));
        }
        Ok(SecretString::new(password))
    }

    pub fn satisfied_by(&self, password: &str) -> bool {
        password.chars().count() == self.length
            && self
                .rules
                .iter()
                .all(|rule| password.chars().filter(|c| rule.charset.contains(*c)).count() >= rule.min_chars)
    }
}

/// Policies stored by name
#[derive(Debug, Default)]
pub struct PasswordPolicies {
    policies: DashMap<String, PasswordPolicy>,
}

impl PasswordPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, policy: PasswordPolicy) -> Result<()> {
        policy.check()?;
        self.policies.insert(name.into(), policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PasswordPolicy> {
        self.policies.get(name).map(|p| p.clone())
    }

    pub fn delete(&self, name: &str) -> bool {
        self.policies.remove(name).is_some()
    }

    pub fn generate(&self, name: &str) -> Result<SecretString> {
        let policy = self.get(name).ok_or_else(|| WardenError::policy_not_found(name))?;
        policy.generate()
    }
}
