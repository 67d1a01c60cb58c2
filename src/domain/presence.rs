use crate::domain::user::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};

/// Heartbeats at most this old count as online (inclusive).
pub const ONLINE_THRESHOLD: Duration = Duration::minutes(5);

/// Heartbeats at most this old count as recently active (inclusive).
pub const RECENT_THRESHOLD: Duration = Duration::minutes(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub last_active: Option<OffsetDateTime>,
}

/// Liveness inferred from the age of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Online,
    RecentlyActive,
    #[default]
    Offline,
}

impl Status {
    /// Classifies a heartbeat observed at `now`. A user that never sent one is offline.
    #[must_use]
    pub fn classify(now: OffsetDateTime, last_active: Option<OffsetDateTime>) -> Self {
        let Some(last_active) = last_active else {
            return Self::Offline;
        };
        let diff = now - last_active;
        if diff <= ONLINE_THRESHOLD {
            Self::Online
        } else if diff <= RECENT_THRESHOLD {
            Self::RecentlyActive
        } else {
            Self::Offline
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::RecentlyActive => "recently active",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
