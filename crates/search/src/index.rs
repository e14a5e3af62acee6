//! Physical indices behind an alias.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an index. Transitions only move forward, except when the
/// repair pass promotes a verified index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Building,
    Verifying,
    Active,
    Superseded,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Verifying => "verifying",
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State persisted with the index (Elasticsearch mapping `_meta`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub status: IndexStatus,
    /// Document count measured when the index passed verification.
    #[serde(default)]
    pub verified_count: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl IndexMeta {
    pub fn building(created_at: DateTime<Utc>) -> Self {
        Self {
            status: IndexStatus::Building,
            verified_count: None,
            created_at,
        }
    }

    pub fn with_status(mut self, status: IndexStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_verified_count(mut self, count: u64) -> Self {
        self.verified_count = Some(count);
        self
    }
}

/// An index as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchIndex {
    pub name: String,
    pub alias: String,
    pub meta: IndexMeta,
    pub document_count: u64,
}

impl SearchIndex {
    pub fn status(&self) -> IndexStatus {
        self.meta.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    /// Whether the alias may point here: passed verification and not yet
    /// replaced.
    pub fn is_eligible(&self) -> bool {
        match self.meta.status {
            IndexStatus::Active => true,
            IndexStatus::Verifying => self.meta.verified_count.is_some(),
            IndexStatus::Building | IndexStatus::Superseded => false,
        }
    }

    /// Count the next index has to reach before it can replace this one.
    pub fn committed_count(&self) -> u64 {
        self.meta.verified_count.unwrap_or(self.document_count)
    }
}

const NAME_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Versioned index name: `<alias>-<YYYYMMDDHHMMSSmmm>` in UTC.
pub fn index_name(alias: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}{:03}",
        alias,
        created_at.format(NAME_TIME_FORMAT),
        created_at.timestamp_subsec_millis()
    )
}

/// Creation time encoded in an index name, if the name belongs to `alias`.
pub fn parse_index_time(alias: &str, name: &str) -> Option<DateTime<Utc>> {
    let suffix = name.strip_prefix(alias)?.strip_prefix('-')?;
    if suffix.len() != 17 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let (seconds, millis) = suffix.split_at(14);
    let naive = NaiveDateTime::parse_from_str(seconds, NAME_TIME_FORMAT).ok()?;
    let millis: i64 = millis.parse().ok()?;

    Some(Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis))
}

/// Wildcard pattern matching every index of an alias.
pub fn index_pattern(alias: &str) -> String {
    format!("{}-*", alias)
}
