//! Rule text parsing.
//!
//! One grammar serves both user-authored custom rules and the lines of
//! subscribed list files. List files additionally carry hosts-format lines
//! (`0.0.0.0 domain`), handled by [`parse_list_line`] before delegating here.

use std::net::IpAddr;

/// What a rule does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Block,
    Allow,
    Comment,
}

/// A parsed rule line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    /// Lower-cased domain. Empty for comments.
    pub domain: String,
    /// The trimmed line the rule came from.
    pub text: String,
}

/// Hosts-file entries that describe the local machine rather than trackers.
const HOSTS_BOILERPLATE: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
    "0.0.0.0",
];

/// Parse one line of rule text. Returns `None` for lines that do not yield a
/// valid rule; that is a skip, not an error.
///
/// Checked in order, first match wins:
/// `!comment`, `@@||domain^`, `@@domain`, `||domain^`, bare domain.
pub fn parse(line: &str) -> Option<Rule> {
    let text = line.trim();
    if text.is_empty() {
        return None;
    }

    if text.starts_with('!') {
        return Some(Rule {
            kind: RuleKind::Comment,
            domain: String::new(),
            text: text.to_string(),
        });
    }

    let (kind, candidate) = if let Some(inner) = text
        .strip_prefix("@@||")
        .and_then(|rest| rest.strip_suffix('^'))
    {
        (RuleKind::Allow, inner)
    } else if let Some(inner) = text.strip_prefix("@@") {
        (RuleKind::Allow, inner)
    } else if let Some(inner) = text.strip_prefix("||").and_then(|rest| rest.strip_suffix('^')) {
        (RuleKind::Block, inner)
    } else {
        (RuleKind::Block, text)
    };

    let domain = normalize_domain(candidate)?;
    Some(Rule {
        kind,
        domain,
        text: text.to_string(),
    })
}

/// Parse a multi-line block, keeping only the lines that produced a rule.
pub fn parse_many(text: &str) -> Vec<Rule> {
    text.lines().filter_map(parse).collect()
}

/// Parse one line of a remote list file.
///
/// Hosts-format lines have their leading address token stripped, trailing
/// `#` comments removed and local-machine names skipped. Everything else goes
/// through [`parse`]. Comments of either flavour yield `None`.
pub fn parse_list_line(line: &str) -> Option<Rule> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    if first.parse::<IpAddr>().is_ok() {
        let host = tokens.next()?;
        if host.starts_with('#') || HOSTS_BOILERPLATE.contains(&host.to_ascii_lowercase().as_str())
        {
            return None;
        }
        return parse(host).filter(|rule| rule.kind == RuleKind::Block);
    }

    // Strip trailing comments on adblock/bare lines ("domain.com # note").
    let line = match line.find(" #") {
        Some(idx) => line[..idx].trim_end(),
        None => line,
    };

    parse(line).filter(|rule| rule.kind != RuleKind::Comment)
}

/// Render a block rule in adblock syntax.
pub fn format_block_rule(domain: &str) -> String {
    format!("||{}^", domain.trim().to_ascii_lowercase())
}

/// Render an allow rule in adblock syntax.
pub fn format_allow_rule(domain: &str) -> String {
    format!("@@||{}^", domain.trim().to_ascii_lowercase())
}

/// Lower-case and validate a candidate domain.
pub fn normalize_domain(candidate: &str) -> Option<String> {
    let domain = candidate.trim().to_ascii_lowercase();
    is_valid_domain(&domain).then_some(domain)
}

/// Hostname grammar: labels of `[a-z0-9]([a-z0-9-]*[a-z0-9])?` joined by
/// single dots, no leading or trailing dot.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= 63
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}
