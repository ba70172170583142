use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::{parse_list_line, RuleKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterCategory {
    Ad,
    Security,
}

/// A subscribed remote list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterSource {
    pub id: u32,
    pub url: String,
    pub enabled: bool,
    pub built_in: bool,
    pub category: FilterCategory,
    pub domain_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Domains extracted from one list download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedList {
    pub blocked: Vec<Box<str>>,
    pub exceptions: Vec<Box<str>>,
}

impl ParsedList {
    pub fn from_text(text: &str) -> Self {
        let mut list = Self::default();
        for line in text.lines() {
            list.push_line(line);
        }
        list
    }

    /// Parse and keep one list line. Unrecognized lines are skipped.
    pub fn push_line(&mut self, line: &str) {
        if let Some(rule) = parse_list_line(line) {
            match rule.kind {
                RuleKind::Block => self.blocked.push(rule.domain.into_boxed_str()),
                RuleKind::Allow => self.exceptions.push(rule.domain.into_boxed_str()),
                RuleKind::Comment => {}
            }
        }
    }

    pub fn domain_count(&self) -> usize {
        self.blocked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_list_content() {
        let list = ParsedList::from_text(
            "# hosts header\n\
             127.0.0.1 localhost\n\
             0.0.0.0 ads.example.com\n\
             ||analytics.example.com^\n\
             @@||ok.example.com^\n\
             malware.example.com\n\
             ! comment\n\
             ##.banner\n",
        );
        assert_eq!(
            list.blocked,
            vec![
                "ads.example.com".into(),
                "analytics.example.com".into(),
                "malware.example.com".into()
            ]
        );
        assert_eq!(list.exceptions, vec!["ok.example.com".into()]);
        assert_eq!(list.domain_count(), 3);
    }

    #[test]
    fn test_source_serializes_with_timestamp() {
        let source = FilterSource {
            id: 3,
            url: "https://lists.test/a".to_string(),
            enabled: true,
            built_in: false,
            category: FilterCategory::Security,
            domain_count: 12,
            last_updated: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
        };
        let text = toml::to_string(&source).unwrap();
        assert!(text.contains("category = \"security\""));
        assert!(text.contains("last_updated = \"2023-11-14T22:13:20Z\""));
    }
}
