mod confidence;
mod executor;

pub use confidence::Fingerprint;
pub use executor::{run_loop, PurgeExecutor};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A tab that was actually closed. Created at close time, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeRecord {
    pub title: String,
    pub url: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

/// Outcome counts of one scan cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Pages closed (or, in a dry run, that would have been)
    pub purged: usize,
    pub kept: usize,
    /// Pages that failed or timed out mid-scan
    pub skipped: usize,
    pub dry_run: bool,
}

/// RFC 3339, or a zone-less ISO timestamp taken as local time (older
/// archives wrote those).
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let naive: NaiveDateTime = raw.parse().map_err(serde::de::Error::custom)?;
    Ok(Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc()))
}
