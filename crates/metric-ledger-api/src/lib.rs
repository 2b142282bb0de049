use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use metric_ledger_core::{
    apply_update, format_calendar_date, format_wall_clock, migrate_dataset, normalize_dataset,
    reconcile, Cadence, MetricKind, MetricRecord, StoredRecord, UpdateOutcome, UserRegistration,
};
use metric_ledger_sources::{
    http_agent, GithubContributionsSource, LeetcodeGraphqlSource, LeetcodeSession, MetricSource,
    PredictedRatingSource,
};
use metric_ledger_store::{value_digest, SnapshotStore, SqliteSnapshotStore, WorkerKvStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

pub mod config;

pub use config::{KeyConfig, LedgerConfig, StoreBackend};

pub const BACKUP_KEY_SUFFIX: &str = ":backup";

/// Open the configured snapshot store. SQLite stores are migrated to the latest schema.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated.
pub fn open_store(config: &LedgerConfig) -> Result<Box<dyn SnapshotStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let mut store = SqliteSnapshotStore::open(&config.store.sqlite_path)?;
            store.migrate()?;
            Ok(Box::new(store))
        }
        StoreBackend::Worker => {
            let url = config
                .store
                .worker_url
                .as_deref()
                .ok_or_else(|| anyhow!("store.worker_url is required for the worker backend"))?;
            Ok(Box::new(WorkerKvStore::new(url, config.http.timeout(), &config.http.user_agent)?))
        }
    }
}

/// Build the live platform source for `metric`.
///
/// A `contest` name selects the predicted-rating service for `leetcode_rating`.
/// Credentials are read from the environment variables named in the configuration.
///
/// # Errors
/// Returns an error when the combination is unsupported or a required credential is missing.
pub fn build_source(
    config: &LedgerConfig,
    metric: MetricKind,
    contest: Option<&str>,
) -> Result<Box<dyn MetricSource>> {
    let agent = http_agent(config.http.timeout(), &config.http.user_agent);
    let credentials = &config.credentials;

    match (metric, contest) {
        (MetricKind::LeetcodeRating, Some(contest)) => {
            Ok(Box::new(PredictedRatingSource::new(agent, contest)?))
        }
        (MetricKind::LeetcodeProblems | MetricKind::LeetcodeRating, None) => {
            let session = LeetcodeSession {
                session: std::env::var(&credentials.leetcode_session_env).ok(),
                csrf_token: std::env::var(&credentials.leetcode_csrf_env).ok(),
            };
            Ok(Box::new(LeetcodeGraphqlSource::new(agent, metric, session)?))
        }
        (MetricKind::GithubContributions, None) => {
            let token = std::env::var(&credentials.github_token_env).with_context(|| {
                format!("{} must hold a GitHub token", credentials.github_token_env)
            })?;
            Ok(Box::new(GithubContributionsSource::new(agent, &token)?))
        }
        (other, Some(_)) => Err(anyhow!("--contest only applies to leetcode_rating, not {other}")),
    }
}

fn load_json_list<T: serde::de::DeserializeOwned>(
    store: &dyn SnapshotStore,
    key: &str,
) -> Result<Vec<T>> {
    match store.get(key).with_context(|| format!("snapshot store unavailable for {key}"))? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value)
            .with_context(|| format!("stored value under {key} is not a valid list")),
    }
}

/// # Errors
/// Returns an error when the store is unavailable or the registry is malformed.
pub fn list_registry(store: &dyn SnapshotStore, keys: &KeyConfig) -> Result<Vec<UserRegistration>> {
    load_json_list(store, &keys.registry)
}

/// # Errors
/// Returns an error when the store is unavailable or the dataset is malformed.
pub fn load_dataset(store: &dyn SnapshotStore, key: &str) -> Result<Vec<StoredRecord>> {
    load_json_list(store, key)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegisterRequest {
    pub leetcode_username: Option<String>,
    pub github_username: Option<String>,
    pub display_name: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// Append a new user to the registry with a fresh id.
///
/// # Errors
/// Returns an error when either platform handle is missing, a handle is already
/// registered on either platform, or the store is unavailable.
pub fn register_user(
    store: &mut dyn SnapshotStore,
    keys: &KeyConfig,
    request: RegisterRequest,
    at: OffsetDateTime,
) -> Result<UserRegistration> {
    let leetcode_username = non_blank(request.leetcode_username);
    let github_username = non_blank(request.github_username);
    let (Some(leetcode), Some(github)) = (leetcode_username.as_deref(), github_username.as_deref())
    else {
        return Err(anyhow!("registration requires both a leetcode and a github username"));
    };
    let default_name = leetcode.to_string();

    let mut registry = list_registry(store, keys)?;
    let requested = [leetcode, github];
    for existing in &registry {
        let taken = [existing.leetcode_username.as_deref(), existing.github_username.as_deref()];
        if let Some(handle) = requested
            .iter()
            .find(|handle| taken.iter().flatten().any(|taken_handle| taken_handle == *handle))
        {
            return Err(anyhow!("user already registered with username {handle}"));
        }
    }

    let registration = UserRegistration {
        id: ulid::Ulid::new().to_string(),
        leetcode_username,
        github_username,
        display_name: non_blank(request.display_name).unwrap_or(default_name),
        created_at: at,
    };
    registration.validate()?;

    registry.push(registration.clone());
    let value = serde_json::to_value(&registry).context("failed to encode registry")?;
    store.put(&keys.registry, &value)?;

    tracing::info!(id = %registration.id, registry_size = registry.len(), "user registered");
    Ok(registration)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CycleReport {
    pub metric: MetricKind,
    pub cadence: Cadence,
    pub dataset_key: String,
    pub source: String,
    pub at: String,
    pub registered: usize,
    pub created: usize,
    pub dropped: usize,
    pub updated: usize,
    pub absent: usize,
    pub history_appended: usize,
    pub absent_usernames: Vec<String>,
    pub written_digest: String,
}

/// Run one update cycle: reconcile, fetch and apply per record, then write the dataset once.
///
/// Absent values keep their record unchanged in the written set. Any validation or
/// store failure aborts before the write.
///
/// # Errors
/// Returns an error when the store is unavailable, stored data is malformed or still
/// holds legacy history, or a record update violates history ordering.
pub fn run_update_cycle(
    store: &mut dyn SnapshotStore,
    keys: &KeyConfig,
    source: &dyn MetricSource,
    cadence: Cadence,
    at: PrimitiveDateTime,
) -> Result<CycleReport> {
    let metric = source.metric();
    let dataset_key = keys.dataset(metric).to_string();
    tracing::info!(
        %metric,
        cadence = cadence.as_str(),
        dataset_key = %dataset_key,
        source = source.name(),
        "update cycle started"
    );

    let registry = list_registry(store, keys)?;
    let dataset = normalize_dataset(load_dataset(store, &dataset_key)?)
        .with_context(|| format!("dataset {dataset_key} cannot be updated"))?;
    let known = dataset.iter().map(|record| record.username.clone()).collect::<BTreeSet<_>>();
    let dataset_len = dataset.len();

    let mut records = reconcile(&registry, dataset, metric.platform())?;
    let created = records.iter().filter(|record| !known.contains(&record.username)).count();
    let dropped = dataset_len - (records.len() - created);

    let mut updated = 0;
    let mut history_appended = 0;
    let mut absent_usernames = Vec::new();
    for record in &mut records {
        let fetched = source.fetch(&record.username);
        match apply_update(record, fetched, cadence, at)
            .with_context(|| format!("failed to update {}", record.username))?
        {
            UpdateOutcome::Absent => absent_usernames.push(record.username.clone()),
            UpdateOutcome::Updated { previous_value, current_value, delta, history_appended: appended } => {
                updated += 1;
                if appended {
                    history_appended += 1;
                }
                tracing::debug!(
                    username = %record.username,
                    previous_value,
                    current_value,
                    delta,
                    "record updated"
                );
            }
        }
    }

    let value = serde_json::to_value(&records).context("failed to encode dataset")?;
    let written_digest = value_digest(&value)?;
    store.put(&dataset_key, &value)?;

    tracing::info!(
        %metric,
        registered = records.len(),
        updated,
        absent = absent_usernames.len(),
        created,
        dropped,
        digest = %written_digest,
        "update cycle finished"
    );

    Ok(CycleReport {
        metric,
        cadence,
        dataset_key,
        source: source.name().to_string(),
        at: format_wall_clock(at),
        registered: records.len(),
        created,
        dropped,
        updated,
        absent: absent_usernames.len(),
        history_appended,
        absent_usernames,
        written_digest,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoryMigrationReport {
    pub dataset_key: String,
    pub dry_run: bool,
    pub reference_date: String,
    pub interval_days: u32,
    pub records: usize,
    pub migrated: usize,
    pub already_dated: usize,
    pub migrated_usernames: Vec<String>,
    pub backup_key: Option<String>,
    pub written: bool,
    pub digest_before: Option<String>,
    pub digest_after: Option<String>,
}

/// Rewrite a persisted dataset's legacy history into dated entries.
///
/// The previous value is copied to `<key>:backup` before the dataset is replaced.
/// A dry run reports the outcome without writing anything.
///
/// # Errors
/// Returns an error when the store is unavailable, the dataset is malformed, or
/// backfilled dates fall out of range.
pub fn migrate_history_pass(
    store: &mut dyn SnapshotStore,
    dataset_key: &str,
    reference_date: Date,
    interval_days: u32,
    dry_run: bool,
) -> Result<HistoryMigrationReport> {
    let original = store
        .get(dataset_key)
        .with_context(|| format!("snapshot store unavailable for {dataset_key}"))?
        .filter(|value| !value.is_null());
    let stored: Vec<StoredRecord> = match &original {
        None => Vec::new(),
        Some(value) => serde_json::from_value(value.clone())
            .with_context(|| format!("stored value under {dataset_key} is not a valid dataset"))?,
    };
    let record_count = stored.len();

    let (records, report) = migrate_dataset(stored, reference_date, interval_days)?;
    let migrated_value = serde_json::to_value(&records).context("failed to encode migrated dataset")?;

    let digest_before = original.as_ref().map(value_digest).transpose()?;
    let digest_after = Some(value_digest(&migrated_value)?);
    let changed = original.as_ref().is_some_and(|value| *value != migrated_value);

    let mut backup_key = None;
    if changed && !dry_run {
        if let Some(previous) = &original {
            let key = format!("{dataset_key}{BACKUP_KEY_SUFFIX}");
            store.put(&key, previous).with_context(|| format!("failed to back up {dataset_key}"))?;
            backup_key = Some(key);
        }
        store.put(dataset_key, &migrated_value)?;
    }

    tracing::info!(
        dataset_key,
        dry_run,
        migrated = report.migrated,
        already_dated = report.already_dated,
        written = changed && !dry_run,
        "history migration pass finished"
    );

    Ok(HistoryMigrationReport {
        dataset_key: dataset_key.to_string(),
        dry_run,
        reference_date: format_calendar_date(reference_date),
        interval_days,
        records: record_count,
        migrated: report.migrated,
        already_dated: report.already_dated,
        migrated_usernames: report.migrated_usernames,
        backup_key,
        written: changed && !dry_run,
        digest_before,
        digest_after,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DatasetView {
    pub dataset_key: String,
    pub exists: bool,
    pub record_count: usize,
    pub legacy_records: usize,
    pub digest: Option<String>,
    pub records: Value,
}

/// Persisted dataset as stored, with its digest and the count of unmigrated records.
///
/// # Errors
/// Returns an error when the store is unavailable or the dataset is malformed.
pub fn show_dataset(store: &dyn SnapshotStore, dataset_key: &str) -> Result<DatasetView> {
    let raw = store
        .get(dataset_key)
        .with_context(|| format!("snapshot store unavailable for {dataset_key}"))?;
    let Some(records) = raw.filter(|value| !value.is_null()) else {
        return Ok(DatasetView {
            dataset_key: dataset_key.to_string(),
            exists: false,
            record_count: 0,
            legacy_records: 0,
            digest: None,
            records: Value::Array(Vec::new()),
        });
    };

    let stored: Vec<StoredRecord> = serde_json::from_value(records.clone())
        .with_context(|| format!("stored value under {dataset_key} is not a valid dataset"))?;
    Ok(DatasetView {
        dataset_key: dataset_key.to_string(),
        exists: true,
        record_count: stored.len(),
        legacy_records: stored.iter().filter(|record| record.has_legacy_history()).count(),
        digest: Some(value_digest(&records)?),
        records,
    })
}

/// Working records for a dataset, for callers that need typed access.
///
/// # Errors
/// Returns an error when the dataset is unavailable or still holds legacy history.
pub fn load_records(store: &dyn SnapshotStore, dataset_key: &str) -> Result<Vec<MetricRecord>> {
    Ok(normalize_dataset(load_dataset(store, dataset_key)?)?)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use metric_ledger_core::{HistoryEntry, LedgerError, RECORD_SCHEMA_VERSION};
    use metric_ledger_sources::JsonFileSource;
    use metric_ledger_store::MemoryStore;
    use serde_json::json;
    use time::macros::{date, datetime};
    use time::Duration;

    use super::*;

    struct UnavailableStore {
        puts: Cell<usize>,
    }

    impl SnapshotStore for UnavailableStore {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            Err(anyhow!("worker returned 503 for {key}"))
        }

        fn put(&mut self, _key: &str, _value: &Value) -> Result<()> {
            self.puts.set(self.puts.get() + 1);
            Ok(())
        }
    }

    fn fixture_created_at() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn registry_value() -> Value {
        json!([
            {"id": "u1", "leetcode_username": "alice", "github_username": "alice-gh",
             "display_name": "Alice", "created_at": "2025-01-05T10:00:00Z"},
            {"id": "u2", "leetcode_username": "bob", "github_username": "bob-gh",
             "display_name": "Bob", "created_at": "2025-01-06T10:00:00Z"}
        ])
    }

    fn replay(values: &[(&str, Option<i64>)]) -> JsonFileSource {
        let values = values
            .iter()
            .map(|(username, value)| ((*username).to_string(), *value))
            .collect::<BTreeMap<_, _>>();
        JsonFileSource::from_values(MetricKind::LeetcodeProblems, values)
    }

    fn stored_records(store: &MemoryStore, key: &str) -> Result<Vec<MetricRecord>> {
        load_records(store, key)
    }

    #[test]
    fn cycle_creates_updates_and_writes_once() -> Result<()> {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new()
            .with_entry("users:list", registry_value())
            .with_entry(
                "leetcode:problems",
                json!([
                    {"username": "alice", "current_value": 100, "previous_value": 90, "delta": 10,
                     "history": [], "last_updated": "2025-07-14 06:00:00", "schema_version": 2},
                    {"username": "mallory", "current_value": 5, "history": []}
                ]),
            );

        let report = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", Some(104)), ("bob", Some(50))]),
            Cadence::Weekly,
            datetime!(2025-07-22 06:00:00),
        )?;

        assert_eq!(store.write_count(), 1);
        assert_eq!(report.registered, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.updated, 2);
        assert_eq!(report.history_appended, 2);
        assert_eq!(report.at, "2025-07-22 06:00:00");

        let records = stored_records(&store, "leetcode:problems")?;
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].previous_value, records[0].current_value, records[0].delta), (100, 104, 4));
        assert_eq!(records[1].username, "bob");
        assert_eq!(records[1].display_name.as_deref(), Some("Bob"));
        assert_eq!(records[1].delta, 0);
        assert_eq!(records[1].history, vec![HistoryEntry { date: date!(2025 - 07 - 22), value: 50 }]);

        let written = store.get("leetcode:problems")?.unwrap_or_default();
        assert_eq!(report.written_digest, value_digest(&written)?);
        Ok(())
    }

    #[test]
    fn absent_user_is_kept_unchanged() -> Result<()> {
        let keys = KeyConfig::default();
        let alice = json!({"username": "alice", "display_name": null, "current_value": 100,
            "previous_value": 90, "delta": 10, "history": [{"date": "2025-07-15", "value": 100}],
            "last_updated": "2025-07-15 06:00:00", "schema_version": 2});
        let mut store = MemoryStore::new()
            .with_entry("users:list", registry_value())
            .with_entry("leetcode:problems", json!([alice.clone()]));

        let report = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", None), ("bob", Some(7))]),
            Cadence::Weekly,
            datetime!(2025-07-22 06:00:00),
        )?;

        assert_eq!(report.absent_usernames, vec!["alice".to_string()]);
        let written = store.get("leetcode:problems")?.unwrap_or_default();
        assert_eq!(written[0], alice);
        assert_eq!(written.as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[test]
    fn validation_failure_aborts_without_write() {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new()
            .with_entry(
                "users:list",
                json!([
                    {"id": "u1", "leetcode_username": "alice", "display_name": "A",
                     "created_at": "2025-01-05T10:00:00Z"},
                    {"id": "u2", "github_username": "bob-gh", "display_name": "B",
                     "created_at": "2025-01-05T10:00:00Z"}
                ]),
            )
            .with_entry("leetcode:problems", json!([]));

        let result = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", Some(1))]),
            Cadence::Daily,
            datetime!(2025-07-22 06:00:00),
        );

        let err = match result {
            Ok(report) => panic!("cycle should fail, got {report:?}"),
            Err(err) => err,
        };
        assert!(matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::Validation(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn backwards_weekly_date_aborts_without_write() {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new()
            .with_entry("users:list", registry_value())
            .with_entry(
                "leetcode:problems",
                json!([{"username": "alice", "current_value": 3, "history": [{"date": "2025-07-29", "value": 3}],
                        "last_updated": "2025-07-29 06:00:00", "schema_version": 2}]),
            );

        let result = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", Some(4)), ("bob", Some(1))]),
            Cadence::Weekly,
            datetime!(2025-07-22 06:00:00),
        );

        assert!(result.is_err());
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn legacy_dataset_must_be_migrated_before_updating() {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new()
            .with_entry("users:list", registry_value())
            .with_entry("leetcode:problems", json!([{"name": "alice", "problems_each_week": [1, 2]}]));

        let result = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", Some(3))]),
            Cadence::Daily,
            datetime!(2025-07-22 06:00:00),
        );

        let message = result.err().map(|err| format!("{err:#}")).unwrap_or_default();
        assert!(message.contains("migration"), "unexpected error: {message}");
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn unavailable_store_aborts_cycle_without_write() {
        let keys = KeyConfig::default();
        let mut store = UnavailableStore { puts: Cell::new(0) };

        let result = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[]),
            Cadence::Daily,
            datetime!(2025-07-22 06:00:00),
        );

        assert!(result.is_err());
        assert_eq!(store.puts.get(), 0);
    }

    #[test]
    fn register_user_appends_and_rejects_duplicate_handles() -> Result<()> {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new().with_entry("users:list", registry_value());

        let registered = register_user(
            &mut store,
            &keys,
            RegisterRequest {
                leetcode_username: Some(" carol ".to_string()),
                github_username: Some("carol-gh".to_string()),
                display_name: None,
            },
            fixture_created_at(),
        )?;
        assert_eq!(registered.leetcode_username.as_deref(), Some("carol"));
        assert_eq!(registered.display_name, "carol");
        assert_eq!(registered.id.len(), 26);

        let registry = list_registry(&store, &keys)?;
        assert_eq!(registry.len(), 3);
        assert_eq!(registry[2], registered);

        let duplicate = register_user(
            &mut store,
            &keys,
            RegisterRequest {
                leetcode_username: Some("dave".to_string()),
                github_username: Some("bob-gh".to_string()),
                display_name: Some("Dave".to_string()),
            },
            fixture_created_at(),
        );
        assert!(duplicate.is_err());
        assert_eq!(store.write_count(), 1);
        Ok(())
    }

    #[test]
    fn register_user_requires_both_handles() {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new();

        for (leetcode, github) in [(Some("  "), Some("octo")), (None, Some("octo")), (Some("alice"), None)] {
            let result = register_user(
                &mut store,
                &keys,
                RegisterRequest {
                    leetcode_username: leetcode.map(str::to_string),
                    github_username: github.map(str::to_string),
                    display_name: Some("Nobody".to_string()),
                },
                fixture_created_at(),
            );

            let message = result.err().map(|err| err.to_string()).unwrap_or_default();
            assert!(message.contains("both"), "unexpected error: {message}");
        }
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn registered_users_feed_both_platform_cycles() -> Result<()> {
        let keys = KeyConfig::default();
        let mut store = MemoryStore::new();
        for (leetcode, github) in [("alice", "alice-gh"), ("bob", "octo")] {
            register_user(
                &mut store,
                &keys,
                RegisterRequest {
                    leetcode_username: Some(leetcode.to_string()),
                    github_username: Some(github.to_string()),
                    display_name: None,
                },
                fixture_created_at(),
            )?;
        }
        let rejected = register_user(
            &mut store,
            &keys,
            RegisterRequest {
                leetcode_username: Some("carol".to_string()),
                github_username: None,
                display_name: None,
            },
            fixture_created_at(),
        );
        assert!(rejected.is_err());

        let github = JsonFileSource::from_values(
            MetricKind::GithubContributions,
            BTreeMap::from([("alice-gh".to_string(), Some(40)), ("octo".to_string(), Some(1500))]),
        );
        let github_report =
            run_update_cycle(&mut store, &keys, &github, Cadence::Daily, datetime!(2025-07-22 06:00:00))?;
        assert_eq!((github_report.registered, github_report.updated), (2, 2));

        let leetcode_report = run_update_cycle(
            &mut store,
            &keys,
            &replay(&[("alice", Some(12)), ("bob", Some(30))]),
            Cadence::Daily,
            datetime!(2025-07-22 06:00:00),
        )?;
        assert_eq!((leetcode_report.registered, leetcode_report.updated), (2, 2));

        let contributions = stored_records(&store, "github:contributions")?;
        assert_eq!(contributions[1].username, "octo");
        assert_eq!(contributions[1].display_name.as_deref(), Some("bob"));
        Ok(())
    }

    #[test]
    fn history_pass_backs_up_and_rewrites_legacy_records() -> Result<()> {
        let original = json!([
            {"name": "alice", "elo": 1500, "problems_each_week": [3, 7, 12]},
            {"username": "bob", "history": [{"date": "2025-07-22", "count": 9}]}
        ]);
        let mut store = MemoryStore::new().with_entry("leetcode:problems", original.clone());

        let report = migrate_history_pass(&mut store, "leetcode:problems", date!(2025 - 07 - 22), 7, false)?;

        assert!(report.written);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.already_dated, 1);
        assert_eq!(report.backup_key.as_deref(), Some("leetcode:problems:backup"));
        assert_eq!(store.get("leetcode:problems:backup")?, Some(original.clone()));
        assert_eq!(report.digest_before, Some(value_digest(&original)?));

        let records = stored_records(&store, "leetcode:problems")?;
        assert_eq!(records[0].history[0], HistoryEntry { date: date!(2025 - 07 - 08), value: 3 });
        assert_eq!(records[0].extra.get("elo"), Some(&json!(1500)));
        assert!(records.iter().all(|record| record.schema_version == RECORD_SCHEMA_VERSION));

        let again = migrate_history_pass(&mut store, "leetcode:problems", date!(2025 - 07 - 22), 7, false)?;
        assert!(!again.written);
        assert_eq!(again.migrated, 0);
        assert_eq!(store.write_count(), 2);
        Ok(())
    }

    #[test]
    fn history_pass_dry_run_writes_nothing() -> Result<()> {
        let mut store = MemoryStore::new()
            .with_entry("github:contributions", json!([{"username": "octo", "history": [4, 8]}]));

        let report =
            migrate_history_pass(&mut store, "github:contributions", date!(2025 - 07 - 22), 7, true)?;

        assert!(report.dry_run);
        assert!(!report.written);
        assert_eq!(report.migrated_usernames, vec!["octo".to_string()]);
        assert_eq!(report.backup_key, None);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn history_pass_treats_null_dataset_as_missing() -> Result<()> {
        let mut store = MemoryStore::new().with_entry("leetcode:problems", Value::Null);

        let report = migrate_history_pass(&mut store, "leetcode:problems", date!(2025 - 07 - 22), 7, false)?;

        assert!(!report.written);
        assert_eq!(report.backup_key, None);
        assert_eq!(report.digest_before, None);
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.get("leetcode:problems:backup")?, None);
        Ok(())
    }

    #[test]
    fn history_pass_migrates_original_github_dataset() -> Result<()> {
        let mut store = MemoryStore::new().with_entry(
            "github:contributions",
            json!([{
                "github_username": "octo",
                "current_contributions": 1500,
                "prev_contributions": 1480,
                "contribution_delta": 20,
                "last_updated": "2025-07-15 06:00:00",
                "contributions_each_week": [{"date": "2025-07-15", "count": 1500}]
            }]),
        );

        let report =
            migrate_history_pass(&mut store, "github:contributions", date!(2025 - 07 - 22), 7, false)?;
        assert!(report.written);
        assert_eq!(report.already_dated, 1);

        let records = stored_records(&store, "github:contributions")?;
        assert_eq!(records[0].username, "octo");
        assert_eq!((records[0].previous_value, records[0].current_value, records[0].delta), (1480, 1500, 20));
        Ok(())
    }

    #[test]
    fn history_pass_on_missing_dataset_is_empty() -> Result<()> {
        let mut store = MemoryStore::new();

        let report = migrate_history_pass(&mut store, "leetcode:rating", date!(2025 - 07 - 22), 7, false)?;

        assert_eq!(report.records, 0);
        assert!(!report.written);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn show_dataset_counts_legacy_records() -> Result<()> {
        let store = MemoryStore::new().with_entry(
            "leetcode:problems",
            json!([{"name": "alice", "history": [1]}, {"username": "bob", "history": []}]),
        );

        let view = show_dataset(&store, "leetcode:problems")?;
        assert!(view.exists);
        assert_eq!(view.record_count, 2);
        assert_eq!(view.legacy_records, 1);
        assert!(view.digest.as_deref().is_some_and(|digest| digest.starts_with("sha256:")));

        let missing = show_dataset(&store, "github:contributions")?;
        assert!(!missing.exists);
        assert_eq!(missing.digest, None);
        Ok(())
    }

    #[test]
    fn contest_flag_only_applies_to_rating() {
        let config = LedgerConfig::default();

        assert!(build_source(&config, MetricKind::LeetcodeRating, Some("weekly-contest-400")).is_ok());
        assert!(build_source(&config, MetricKind::LeetcodeProblems, Some("weekly-contest-400")).is_err());
        assert!(build_source(&config, MetricKind::LeetcodeProblems, None).is_ok());
    }
}
