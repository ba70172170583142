use chrono::NaiveDateTime;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::schedule::{DaySet, TimeWindow};
use crate::config::{FirewallConfig, FirewallRuleConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    #[default]
    Other,
}

impl NetworkType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Wifi => 0,
            Self::Cellular => 1,
            Self::Other => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Wifi,
            1 => Self::Cellular,
            _ => Self::Other,
        }
    }
}

/// Network restriction for one installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub package: String,
    pub block_wifi: bool,
    pub block_mobile_data: bool,
    /// `None` means the rule applies around the clock.
    pub schedule: Option<TimeWindow>,
}

impl FirewallRule {
    pub fn from_config(cfg: &FirewallRuleConfig) -> Self {
        let schedule = match (cfg.schedule_enabled, cfg.start, cfg.end) {
            (false, _, _) => None,
            (true, Some(start), Some(end)) => {
                Some(TimeWindow::new(start, end, DaySet::from_iso(&cfg.days)))
            }
            (true, _, _) => {
                warn!(
                    "Firewall rule for {} enables a schedule without start/end; applying always",
                    cfg.package
                );
                None
            }
        };
        Self {
            package: cfg.package.clone(),
            block_wifi: cfg.block_wifi,
            block_mobile_data: cfg.block_mobile_data,
            schedule,
        }
    }

    pub fn denies(&self, network: NetworkType, at: &NaiveDateTime) -> bool {
        let network_blocked = match network {
            NetworkType::Wifi => self.block_wifi,
            NetworkType::Cellular => self.block_mobile_data,
            NetworkType::Other => false,
        };
        network_blocked
            && match &self.schedule {
                Some(window) => window.contains(at),
                None => true,
            }
    }
}

/// Per-app allow/deny. Apps without a rule are unrestricted.
#[derive(Debug, Clone, Default)]
pub struct FirewallPolicy {
    enabled: bool,
    rules: FxHashMap<String, FirewallRule>,
}

impl FirewallPolicy {
    pub fn new(enabled: bool, rules: impl IntoIterator<Item = FirewallRule>) -> Self {
        Self {
            enabled,
            rules: rules.into_iter().map(|r| (r.package.clone(), r)).collect(),
        }
    }

    pub fn from_config(cfg: &FirewallConfig) -> Self {
        Self::new(cfg.enabled, cfg.rules.iter().map(FirewallRule::from_config))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule(&self, package: &str) -> Option<&FirewallRule> {
        self.rules.get(package)
    }

    pub fn is_denied(&self, package: &str, at: &NaiveDateTime, network: NetworkType) -> bool {
        self.enabled
            && self
                .rules
                .get(package)
                .is_some_and(|rule| rule.denies(network, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        // Wednesday.
        NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn rule(block_wifi: bool, block_mobile_data: bool, schedule: Option<TimeWindow>) -> FirewallRule {
        FirewallRule {
            package: "com.example.game".to_string(),
            block_wifi,
            block_mobile_data,
            schedule,
        }
    }

    #[test]
    fn test_network_type_selects_flag() {
        let policy = FirewallPolicy::new(true, [rule(false, true, None)]);
        assert!(policy.is_denied("com.example.game", &at(12), NetworkType::Cellular));
        assert!(!policy.is_denied("com.example.game", &at(12), NetworkType::Wifi));
        assert!(!policy.is_denied("com.example.game", &at(12), NetworkType::Other));
        assert!(!policy.is_denied("com.example.other", &at(12), NetworkType::Cellular));
    }

    #[test]
    fn test_schedule_gates_rule() {
        let window = TimeWindow::new(
            "20:00".parse().unwrap(),
            "07:00".parse().unwrap(),
            DaySet::ALL,
        );
        let policy = FirewallPolicy::new(true, [rule(true, true, Some(window))]);
        assert!(policy.is_denied("com.example.game", &at(22), NetworkType::Wifi));
        assert!(policy.is_denied("com.example.game", &at(6), NetworkType::Wifi));
        assert!(!policy.is_denied("com.example.game", &at(12), NetworkType::Wifi));
    }

    #[test]
    fn test_disabled_firewall_allows_everything() {
        let policy = FirewallPolicy::new(false, [rule(true, true, None)]);
        assert!(!policy.is_denied("com.example.game", &at(12), NetworkType::Wifi));
    }

    #[test]
    fn test_rule_from_config() {
        let cfg = FirewallRuleConfig {
            package: "com.example.game".to_string(),
            block_wifi: true,
            block_mobile_data: false,
            schedule_enabled: true,
            start: Some("09:00".parse().unwrap()),
            end: Some("17:00".parse().unwrap()),
            days: vec![3],
        };
        let rule = FirewallRule::from_config(&cfg);
        assert!(rule.denies(NetworkType::Wifi, &at(10)));
        assert!(!rule.denies(NetworkType::Wifi, &at(18)));
    }
}
