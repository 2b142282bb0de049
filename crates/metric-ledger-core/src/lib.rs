use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};

/// Current on-disk record schema. Records without a `schema_version` field are version 1.
pub const RECORD_SCHEMA_VERSION: u32 = 2;
pub const LEGACY_RECORD_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_HISTORY_INTERVAL_DAYS: u32 = 7;

// Keeps backfilled dates well inside the calendar range `time` supports.
const MAX_BACKFILL_DAYS: i64 = 3_000_000;

time::serde::format_description!(calendar_date, Date, "[year]-[month]-[day]");
time::serde::format_description!(
    wall_clock,
    PrimitiveDateTime,
    "[year]-[month]-[day] [hour]:[minute]:[second]"
);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("migration error: {0}")]
    Migration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Leetcode,
    Github,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leetcode => "leetcode",
            Self::Github => "github",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    LeetcodeProblems,
    LeetcodeRating,
    GithubContributions,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeetcodeProblems => "leetcode_problems",
            Self::LeetcodeRating => "leetcode_rating",
            Self::GithubContributions => "github_contributions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "leetcode_problems" => Some(Self::LeetcodeProblems),
            "leetcode_rating" => Some(Self::LeetcodeRating),
            "github_contributions" => Some(Self::GithubContributions),
            _ => None,
        }
    }

    /// Platform whose registration handle keys this metric's dataset.
    #[must_use]
    pub fn platform(self) -> Platform {
        match self {
            Self::LeetcodeProblems | Self::LeetcodeRating => Platform::Leetcode,
            Self::GithubContributions => Platform::Github,
        }
    }

    #[must_use]
    pub fn default_dataset_key(self) -> &'static str {
        match self {
            Self::LeetcodeProblems => "leetcode:problems",
            Self::LeetcodeRating => "leetcode:rating",
            Self::GithubContributions => "github:contributions",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
}

impl Cadence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryEntry {
    #[serde(with = "calendar_date")]
    pub date: Date,
    #[serde(alias = "count")]
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRegistration {
    pub id: String,
    #[serde(default)]
    pub leetcode_username: Option<String>,
    #[serde(default)]
    pub github_username: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UserRegistration {
    /// Non-blank handle registered for `platform`, if any.
    #[must_use]
    pub fn handle(&self, platform: Platform) -> Option<&str> {
        let handle = match platform {
            Platform::Leetcode => self.leetcode_username.as_deref(),
            Platform::Github => self.github_username.as_deref(),
        };
        handle.filter(|value| !value.trim().is_empty())
    }

    /// Validate identity fields of one registry entry.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the id is blank or no platform handle is set.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation("registration id MUST be non-empty".to_string()));
        }

        if self.handle(Platform::Leetcode).is_none() && self.handle(Platform::Github).is_none() {
            return Err(LedgerError::Validation(format!(
                "registration {} MUST carry at least one platform username",
                self.id
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MetricRecord {
    pub username: String,
    pub display_name: Option<String>,
    pub current_value: i64,
    pub previous_value: i64,
    pub delta: i64,
    pub history: Vec<HistoryEntry>,
    #[serde(with = "wall_clock::option")]
    pub last_updated: Option<PrimitiveDateTime>,
    pub schema_version: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetricRecord {
    /// Zeroed record for a user seen for the first time.
    #[must_use]
    pub fn new(username: &str, display_name: Option<String>) -> Self {
        Self {
            username: username.to_string(),
            display_name,
            current_value: 0,
            previous_value: 0,
            delta: 0,
            history: Vec::new(),
            last_updated: None,
            schema_version: RECORD_SCHEMA_VERSION,
            extra: BTreeMap::new(),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when the username is blank or history dates
    /// are not strictly increasing.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.username.trim().is_empty() {
            return Err(LedgerError::Validation("record username MUST be non-empty".to_string()));
        }

        for pair in self.history.windows(2) {
            if pair[0].date >= pair[1].date {
                return Err(LedgerError::Validation(format!(
                    "history for {} MUST be strictly increasing by date ({} then {})",
                    self.username,
                    format_calendar_date(pair[0].date),
                    format_calendar_date(pair[1].date)
                )));
            }
        }

        Ok(())
    }
}

/// History exactly as persisted: legacy undated counts or dated entries.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum StoredHistory {
    Legacy(Vec<i64>),
    Dated(Vec<HistoryEntry>),
}

impl Default for StoredHistory {
    fn default() -> Self {
        Self::Dated(Vec::new())
    }
}

impl<'de> Deserialize<'de> for StoredHistory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<Value>::deserialize(deserializer)?;
        match raw.first() {
            None => Ok(Self::Dated(Vec::new())),
            Some(Value::Number(_)) => raw
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    value.as_i64().ok_or_else(|| {
                        D::Error::custom(format!("legacy history entry {index} is not an integer"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Legacy),
            Some(Value::Object(_)) => raw
                .into_iter()
                .map(|value| serde_json::from_value::<HistoryEntry>(value).map_err(D::Error::custom))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Dated),
            Some(other) => Err(D::Error::custom(format!("unsupported history entry: {other}"))),
        }
    }
}

fn legacy_schema_version() -> u32 {
    LEGACY_RECORD_SCHEMA_VERSION
}

/// A dataset record as read from the snapshot store, before schema normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredRecord {
    #[serde(alias = "name", alias = "github_username")]
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, alias = "current_problem_count", alias = "current_contributions")]
    pub current_value: i64,
    #[serde(default, alias = "prev_problem_count", alias = "prev_contributions")]
    pub previous_value: i64,
    #[serde(default, alias = "current_problem_delta", alias = "contribution_delta")]
    pub delta: i64,
    #[serde(default, alias = "problems_each_week", alias = "contributions_each_week")]
    pub history: StoredHistory,
    #[serde(default, with = "wall_clock::option")]
    pub last_updated: Option<PrimitiveDateTime>,
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StoredRecord {
    #[must_use]
    pub fn has_legacy_history(&self) -> bool {
        matches!(&self.history, StoredHistory::Legacy(values) if !values.is_empty())
    }
}

impl From<MetricRecord> for StoredRecord {
    fn from(record: MetricRecord) -> Self {
        Self {
            username: record.username,
            display_name: record.display_name,
            current_value: record.current_value,
            previous_value: record.previous_value,
            delta: record.delta,
            history: StoredHistory::Dated(record.history),
            last_updated: record.last_updated,
            schema_version: record.schema_version,
            extra: record.extra,
        }
    }
}

impl TryFrom<StoredRecord> for MetricRecord {
    type Error = LedgerError;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let history = match stored.history {
            StoredHistory::Dated(entries) => entries,
            StoredHistory::Legacy(values) if values.is_empty() => Vec::new(),
            StoredHistory::Legacy(_) => {
                return Err(LedgerError::Validation(format!(
                    "record {} still carries legacy undated history; run the history migration pass first",
                    stored.username
                )));
            }
        };

        Ok(Self {
            username: stored.username,
            display_name: stored.display_name,
            current_value: stored.current_value,
            previous_value: stored.previous_value,
            delta: stored.delta,
            history,
            last_updated: stored.last_updated,
            schema_version: RECORD_SCHEMA_VERSION,
            extra: stored.extra,
        })
    }
}

/// Normalize a persisted dataset into working records.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when any record still holds legacy history.
pub fn normalize_dataset(records: Vec<StoredRecord>) -> Result<Vec<MetricRecord>, LedgerError> {
    records.into_iter().map(MetricRecord::try_from).collect()
}

#[must_use]
pub fn format_calendar_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string())
}

#[must_use]
pub fn format_wall_clock(at: PrimitiveDateTime) -> String {
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| at.to_string())
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `value` is not `YYYY-MM-DD`.
pub fn parse_calendar_date(value: &str) -> Result<Date, LedgerError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| LedgerError::Validation(format!("invalid calendar date {value}: {err}")))
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `value` is not `YYYY-MM-DD HH:MM:SS`.
pub fn parse_wall_clock(value: &str) -> Result<PrimitiveDateTime, LedgerError> {
    PrimitiveDateTime::parse(value, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map_err(|err| LedgerError::Validation(format!("invalid timestamp {value}: {err}")))
}

fn validate_registry<'a>(
    registry: &'a [UserRegistration],
    platform: Platform,
) -> Result<Vec<&'a str>, LedgerError> {
    let mut seen_ids = BTreeSet::new();
    let mut seen_handles = BTreeSet::new();
    let mut handles = Vec::with_capacity(registry.len());

    for registration in registry {
        registration.validate()?;

        let Some(handle) = registration.handle(platform) else {
            return Err(LedgerError::Validation(format!(
                "registration {} MUST provide a {platform} username",
                registration.id
            )));
        };

        if !seen_ids.insert(registration.id.as_str()) {
            return Err(LedgerError::Validation(format!(
                "registration id {} appears more than once",
                registration.id
            )));
        }

        if !seen_handles.insert(handle) {
            return Err(LedgerError::Validation(format!(
                "{platform} username {handle} is registered more than once"
            )));
        }

        handles.push(handle);
    }

    Ok(handles)
}

/// Merge the user registry with an existing metric dataset.
///
/// Output has exactly one record per registration, in registry order. Existing records
/// are kept as-is, missing ones are synthesized zeroed, and dataset records for users
/// no longer registered are dropped.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when a registration lacks the platform handle,
/// identities are duplicated, or a dataset record violates record invariants.
pub fn reconcile(
    registry: &[UserRegistration],
    dataset: Vec<MetricRecord>,
    platform: Platform,
) -> Result<Vec<MetricRecord>, LedgerError> {
    let handles = validate_registry(registry, platform)?;

    let mut existing: BTreeMap<String, MetricRecord> = BTreeMap::new();
    for record in dataset {
        record.validate()?;
        if existing.contains_key(&record.username) {
            return Err(LedgerError::Validation(format!(
                "dataset contains more than one record for {}",
                record.username
            )));
        }
        existing.insert(record.username.clone(), record);
    }

    Ok(registry
        .iter()
        .zip(handles)
        .map(|(registration, handle)| {
            existing.remove(handle).unwrap_or_else(|| {
                let display_name = Some(registration.display_name.trim())
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                MetricRecord::new(handle, display_name)
            })
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Absent,
    Updated { previous_value: i64, current_value: i64, delta: i64, history_appended: bool },
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

fn record_weekly_entry(
    history: &mut Vec<HistoryEntry>,
    username: &str,
    date: Date,
    value: i64,
) -> Result<bool, LedgerError> {
    match history.last_mut() {
        Some(last) if last.date == date => {
            last.value = value;
            Ok(false)
        }
        Some(last) if last.date > date => Err(LedgerError::Validation(format!(
            "weekly entry for {username} dated {} precedes latest history date {}",
            format_calendar_date(date),
            format_calendar_date(last.date)
        ))),
        _ => {
            history.push(HistoryEntry { date, value });
            Ok(true)
        }
    }
}

/// Fold one fetched value into a record.
///
/// An absent value leaves the record untouched. The first update of a record whose
/// `previous_value` is still zero uses the fetched value as its own baseline, so new
/// users never report a jump from zero. Records carried over with counters but no
/// `last_updated` compute their delta normally.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when a weekly entry would be dated before the
/// record's latest history entry. The record is unchanged in that case.
pub fn apply_update(
    record: &mut MetricRecord,
    fetched_value: Option<i64>,
    cadence: Cadence,
    at: PrimitiveDateTime,
) -> Result<UpdateOutcome, LedgerError> {
    let Some(value) = fetched_value else {
        return Ok(UpdateOutcome::Absent);
    };

    let first_update = record.last_updated.is_none();
    let history_appended = match cadence {
        Cadence::Weekly => record_weekly_entry(&mut record.history, &record.username, at.date(), value)?,
        Cadence::Daily => false,
    };

    let zero_guard = first_update && record.previous_value == 0;
    let previous_value = if zero_guard { value } else { record.current_value };

    record.previous_value = previous_value;
    record.current_value = value;
    record.delta = if zero_guard { 0 } else { value.saturating_sub(previous_value) };
    record.last_updated = Some(at);

    Ok(UpdateOutcome::Updated {
        previous_value: record.previous_value,
        current_value: record.current_value,
        delta: record.delta,
        history_appended,
    })
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigratedRecord {
    pub record: MetricRecord,
    pub rewritten: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub already_dated: usize,
    pub migrated_usernames: Vec<String>,
}

fn backfill_dates(
    values: &[i64],
    reference_date: Date,
    interval_days: u32,
) -> Result<Vec<HistoryEntry>, LedgerError> {
    let last_index = values.len().saturating_sub(1);
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let steps_back = i64::try_from(last_index - index)
                .map_err(|_| LedgerError::Migration("legacy history is too long".to_string()))?;
            let offset_days = steps_back
                .checked_mul(i64::from(interval_days))
                .filter(|days| *days <= MAX_BACKFILL_DAYS)
                .ok_or_else(|| {
                    LedgerError::Migration("backfilled date leaves the supported range".to_string())
                })?;
            let date = reference_date.checked_sub(Duration::days(offset_days)).ok_or_else(|| {
                LedgerError::Migration("backfilled date leaves the supported range".to_string())
            })?;
            Ok(HistoryEntry { date, value: *value })
        })
        .collect()
}

/// Convert one record's legacy undated history into dated entries.
///
/// The last legacy value lands on `reference_date`; each earlier value is placed
/// `interval_days` before its successor. Records whose history is already dated pass
/// through with their history unchanged.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when `interval_days` is zero, or
/// [`LedgerError::Migration`] when a backfilled date is out of range.
pub fn migrate_history(
    stored: StoredRecord,
    reference_date: Date,
    interval_days: u32,
) -> Result<MigratedRecord, LedgerError> {
    if interval_days == 0 {
        return Err(LedgerError::Validation("interval_days MUST be >= 1".to_string()));
    }

    let (history, rewritten) = match stored.history {
        StoredHistory::Dated(entries) => (entries, false),
        StoredHistory::Legacy(values) => {
            (backfill_dates(&values, reference_date, interval_days)?, !values.is_empty())
        }
    };

    Ok(MigratedRecord {
        record: MetricRecord {
            username: stored.username,
            display_name: stored.display_name,
            current_value: stored.current_value,
            previous_value: stored.previous_value,
            delta: stored.delta,
            history,
            last_updated: stored.last_updated,
            schema_version: RECORD_SCHEMA_VERSION,
            extra: stored.extra,
        },
        rewritten,
    })
}

/// Run [`migrate_history`] over a whole persisted dataset.
///
/// # Errors
/// Propagates the first per-record migration failure.
pub fn migrate_dataset(
    records: Vec<StoredRecord>,
    reference_date: Date,
    interval_days: u32,
) -> Result<(Vec<MetricRecord>, MigrationReport), LedgerError> {
    let mut report = MigrationReport::default();
    let mut migrated = Vec::with_capacity(records.len());

    for stored in records {
        let outcome = migrate_history(stored, reference_date, interval_days)?;
        if outcome.rewritten {
            report.migrated += 1;
            report.migrated_usernames.push(outcome.record.username.clone());
        } else {
            report.already_dated += 1;
        }
        migrated.push(outcome.record);
    }

    Ok((migrated, report))
}
