//! Threat signature catalog.
//!
//! A catalog is compiled once from configuration and never mutated; a reload
//! builds a fresh catalog and swaps the whole snapshot.

use regex::Regex;

use crate::config::schema::PatternSpec;
use crate::error::ProtectorError;

/// A compiled threat signature.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pattern: String,
    category: String,
    regex: Regex,
}

impl PatternRule {
    pub fn new(pattern: &str, category: &str) -> Result<Self, ProtectorError> {
        let regex = Regex::new(pattern).map_err(|source| ProtectorError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            category: category.to_string(),
            regex,
        })
    }

    /// Source text of the signature. Operator-facing only.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }
}

/// Ordered, immutable set of compiled signatures.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    rules: Vec<PatternRule>,
}

impl PatternCatalog {
    /// Compile every configured signature, failing on the first invalid one.
    pub fn compile(specs: &[PatternSpec]) -> Result<Self, ProtectorError> {
        let rules = specs
            .iter()
            .map(|spec| PatternRule::new(spec.pattern(), spec.category()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// First rule, in declaration order, matching any of `fields`.
    pub fn first_match<'a, I>(&self, fields: I) -> Option<&PatternRule>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.rules
            .iter()
            .find(|rule| fields.clone().into_iter().any(|field| rule.is_match(field)))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
