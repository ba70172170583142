use std::sync::{Mutex, PoisonError};

use chrono::NaiveDateTime;
use tracing::{info, warn};

use super::schedule::{DaySet, TimeWindow};
use crate::config::{ProfileConfig, ScheduleConfig};

/// Named bundle of filter sources and search restrictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionProfile {
    pub id: u32,
    pub name: String,
    /// Ordered, without duplicates.
    pub enabled_filter_urls: Vec<String>,
    pub safe_search: bool,
    pub youtube_restricted: bool,
}

impl ProtectionProfile {
    pub fn from_config(cfg: &ProfileConfig) -> Self {
        let mut urls: Vec<String> = Vec::with_capacity(cfg.filter_urls.len());
        for url in &cfg.filter_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            enabled_filter_urls: urls,
            safe_search: cfg.safe_search,
            youtube_restricted: cfg.youtube_restricted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSchedule {
    pub id: u32,
    pub profile_id: u32,
    pub window: TimeWindow,
}

impl ProfileSchedule {
    pub fn from_config(cfg: &ScheduleConfig) -> Self {
        Self {
            id: cfg.id,
            profile_id: cfg.profile_id,
            window: TimeWindow::new(cfg.start, cfg.end, DaySet::from_iso(&cfg.days)),
        }
    }
}

/// Outcome of a profile evaluation that changed the active profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileChange {
    Activated(ProtectionProfile),
    /// No profile applies any more; the configured default sources return.
    Deactivated,
}

#[derive(Debug, Default)]
struct Selection {
    manual: Option<u32>,
    active: Option<u32>,
}

/// Picks the active profile: a matching schedule wins over the manual
/// choice. When schedules overlap the one with the lowest id wins.
#[derive(Debug)]
pub struct ProfileManager {
    profiles: Vec<ProtectionProfile>,
    schedules: Vec<ProfileSchedule>,
    selection: Mutex<Selection>,
}

impl ProfileManager {
    pub fn new(
        profiles: Vec<ProtectionProfile>,
        mut schedules: Vec<ProfileSchedule>,
        manual: Option<u32>,
    ) -> Self {
        schedules.sort_by_key(|s| s.id);
        schedules.retain(|s| {
            let known = profiles.iter().any(|p| p.id == s.profile_id);
            if !known {
                warn!(
                    "Schedule {} references unknown profile {}; ignoring",
                    s.id, s.profile_id
                );
            }
            known
        });
        Self {
            profiles,
            schedules,
            selection: Mutex::new(Selection {
                manual,
                active: None,
            }),
        }
    }

    pub fn from_config(
        profiles: &[ProfileConfig],
        schedules: &[ScheduleConfig],
        active_profile: Option<u32>,
    ) -> Self {
        Self::new(
            profiles.iter().map(ProtectionProfile::from_config).collect(),
            schedules.iter().map(ProfileSchedule::from_config).collect(),
            active_profile,
        )
    }

    pub fn profile(&self, id: u32) -> Option<&ProtectionProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn active(&self) -> Option<ProtectionProfile> {
        let active = self.lock().active;
        active.and_then(|id| self.profile(id).cloned())
    }

    /// The schedule-selected profile at `at`, if any.
    pub fn scheduled_profile(&self, at: &NaiveDateTime) -> Option<u32> {
        self.schedules
            .iter()
            .find(|s| s.window.contains(at))
            .map(|s| s.profile_id)
    }

    /// Choose a profile by hand. Unknown ids are rejected.
    pub fn set_manual(&self, id: Option<u32>) -> bool {
        if let Some(id) = id {
            if self.profile(id).is_none() {
                return false;
            }
        }
        self.lock().manual = id;
        true
    }

    /// Re-evaluate at `at`. Returns the change to apply, if the active
    /// profile differs from the previous evaluation.
    pub fn tick(&self, at: &NaiveDateTime) -> Option<ProfileChange> {
        let scheduled = self.scheduled_profile(at);
        let mut selection = self.lock();
        let desired = scheduled.or(selection.manual);
        if desired == selection.active {
            return None;
        }
        selection.active = desired;
        drop(selection);

        match desired.and_then(|id| self.profile(id)) {
            Some(profile) => {
                info!("Activating protection profile {} ({})", profile.id, profile.name);
                Some(ProfileChange::Activated(profile.clone()))
            }
            None => {
                info!("No protection profile active");
                Some(ProfileChange::Deactivated)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
