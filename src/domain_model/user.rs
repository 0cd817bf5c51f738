use crate::domain_model::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Durable presence record mirrored from the presence channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPresence {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

impl UserPresence {
    /// Human readable status line, relative to `now`.
    pub fn label(&self, now: Timestamp) -> String {
        if self.is_online {
            return "Online".to_owned();
        }
        match self.last_seen {
            Some(last_seen) if last_seen.0 > 0 => {
                format!("Last seen {}", describe_elapsed(now, last_seen))
            }
            _ => "Offline".to_owned(),
        }
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n > 1 {
        format!("{n} {unit}s ago")
    } else {
        format!("{n} {unit} ago")
    }
}

fn describe_elapsed(now: Timestamp, then: Timestamp) -> String {
    let diff = now.0 - then.0;
    if diff < MINUTE_MS {
        "just now".to_owned()
    } else if diff < HOUR_MS {
        plural(diff / MINUTE_MS, "minute")
    } else if diff < DAY_MS {
        plural(diff / HOUR_MS, "hour")
    } else if diff < WEEK_MS {
        plural(diff / DAY_MS, "day")
    } else {
        match then.to_datetime() {
            Some(dt) => dt.format("%b %-d, %Y").to_string(),
            None => "a long time ago".to_owned(),
        }
    }
}
