//! Activity level signal

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How engaged the user currently is with the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Active,
    Background,
    Inactive,
}

impl ActivityLevel {
    /// Whether a subscription of `priority` stays connected at this level.
    /// High priority is live at every level.
    pub fn keeps(self, priority: Priority) -> bool {
        match self {
            ActivityLevel::Active => true,
            ActivityLevel::Background => priority != Priority::Low,
            ActivityLevel::Inactive => priority == Priority::High,
        }
    }
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityLevel::Active => write!(f, "active"),
            ActivityLevel::Background => write!(f, "background"),
            ActivityLevel::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Current level plus the time of the last reported user activity
#[derive(Debug)]
pub struct ActivityTracker {
    level: ActivityLevel,
    last_activity: Instant,
    changed_at: Instant,
}

impl ActivityTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            level: ActivityLevel::Active,
            last_activity: now,
            changed_at: now,
        }
    }

    pub fn level(&self) -> ActivityLevel {
        self.level
    }

    /// Note user activity without changing the level
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Switch to `level`. Returns the previous level if it changed.
    pub fn set(&mut self, level: ActivityLevel) -> Option<ActivityLevel> {
        if self.level == level {
            return None;
        }
        let previous = self.level;
        self.level = level;
        self.changed_at = Instant::now();
        Some(previous)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn time_in_level(&self) -> Duration {
        self.changed_at.elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_matrix() {
        use ActivityLevel::*;
        use Priority::*;

        for priority in [High, Medium, Low] {
            assert!(Active.keeps(priority));
        }
        assert!(Background.keeps(High));
        assert!(Background.keeps(Medium));
        assert!(!Background.keeps(Low));
        assert!(Inactive.keeps(High));
        assert!(!Inactive.keeps(Medium));
        assert!(!Inactive.keeps(Low));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_idle_time() {
        let mut tracker = ActivityTracker::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.idle_for(), Duration::from_secs(10));

        tracker.touch();
        assert_eq!(tracker.idle_for(), Duration::ZERO);
    }

    #[test]
    fn test_set_reports_previous_level() {
        let mut tracker = ActivityTracker::new();
        assert_eq!(tracker.set(ActivityLevel::Active), None);
        assert_eq!(tracker.set(ActivityLevel::Inactive), Some(ActivityLevel::Active));
        assert_eq!(tracker.level(), ActivityLevel::Inactive);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&ActivityLevel::Background).unwrap(), "\"background\"");
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }
}
