//! Immutable snapshots of user rules and the whitelist.
//!
//! Both are rebuilt wholesale on edit and swapped into the policy engine, so
//! query tasks only ever read them.

use rustc_hash::FxHashSet;

use super::parser::{self, RuleKind};
use crate::domain::parent_chain;

/// A user-authored rule together with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomRule {
    pub kind: RuleKind,
    pub domain: String,
    pub text: String,
    pub enabled: bool,
    /// Insertion order; only used for display.
    pub order: usize,
}

impl CustomRule {
    /// Parse rule text into an enabled rule at position `order`.
    pub fn parse(text: &str, order: usize) -> Option<Self> {
        parser::parse(text).map(|rule| Self {
            kind: rule.kind,
            domain: rule.domain,
            text: rule.text,
            enabled: true,
            order,
        })
    }
}

/// Lookup structure over the enabled custom rules.
#[derive(Debug, Default)]
pub struct CustomRuleSet {
    allow: FxHashSet<Box<str>>,
    block: FxHashSet<Box<str>>,
    rules: Vec<CustomRule>,
}

impl CustomRuleSet {
    pub fn new(rules: Vec<CustomRule>) -> Self {
        let mut allow = FxHashSet::default();
        let mut block = FxHashSet::default();

        for rule in rules.iter().filter(|r| r.enabled) {
            match rule.kind {
                RuleKind::Allow => {
                    allow.insert(rule.domain.as_str().into());
                }
                RuleKind::Block => {
                    block.insert(rule.domain.as_str().into());
                }
                RuleKind::Comment => {}
            }
        }

        Self { allow, block, rules }
    }

    /// Parse each line of `lines`, dropping the ones that are not rules.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let rules = lines
            .into_iter()
            .filter_map(parser::parse)
            .enumerate()
            .map(|(order, rule)| CustomRule {
                kind: rule.kind,
                domain: rule.domain,
                text: rule.text,
                enabled: true,
                order,
            })
            .collect();
        Self::new(rules)
    }

    /// True if an enabled ALLOW rule names `domain` or one of its parents.
    pub fn allows(&self, domain: &str) -> bool {
        parent_chain(domain).any(|d| self.allow.contains(d))
    }

    /// True if an enabled BLOCK rule names `domain` or one of its parents.
    pub fn blocks(&self, domain: &str) -> bool {
        parent_chain(domain).any(|d| self.block.contains(d))
    }

    pub fn rules(&self) -> &[CustomRule] {
        &self.rules
    }
}

/// Domains exempt from blocking. Exact match only.
#[derive(Debug, Default)]
pub struct Whitelist {
    domains: FxHashSet<Box<str>>,
}

impl Whitelist {
    pub fn new<S: AsRef<str>>(domains: impl IntoIterator<Item = S>) -> Self {
        let domains = domains
            .into_iter()
            .filter_map(|d| parser::normalize_domain(d.as_ref()))
            .map(String::into_boxed_str)
            .collect();
        Self { domains }
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
