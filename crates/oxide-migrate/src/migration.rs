//! Migration scripts and their execution.
//!
//! A script is an ordered list of DDL statements under a time-sortable id
//! (`%Y%m%d%H%M%S_<label>`). Scripts are applied in id order, each in its
//! own transaction that also records it in the metadata table. A failed
//! script leaves a marker behind that blocks further upgrades until it is
//! reconciled with [`MigrationManager::mark_applied`] or
//! [`MigrationManager::clear_failure`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use oxide_schema::compiler::CompileOptions;
use oxide_schema::diff::{DatabaseDiff, ModifyPolicy, SchemaDiffEngine};
use oxide_schema::registry::{SchemaRegistry, METADATA_TABLE};
use oxide_schema::schema::TableSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{MigrateError, Result};
use crate::introspect::TableIntrospector;
use crate::metadata::{
    insert_with, last_applied_of, values_with, FailureRecord, FailureState, MetadataStore,
    MigrationRecord, MIGRATION_KEY,
};

/// A migration script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Time-sortable id, also the file stem.
    pub id: String,
    /// Human readable label.
    pub label: String,
    /// Statements, executed in order.
    pub statements: Vec<String>,
}

impl MigrationScript {
    /// Creates a script with an id derived from the current time.
    #[must_use]
    pub fn new(label: impl Into<String>, statements: Vec<String>) -> Self {
        let label = label.into();
        Self {
            id: script_id(&label, Utc::now()),
            label,
            statements,
        }
    }

    /// Creates a script with an explicit id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, label: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            statements,
        }
    }

    /// File name the script is stored under.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Reads a script file. The file stem must equal the script id.
    pub fn from_file(path: &Path) -> Result<Self> {
        let invalid = |message: String| MigrateError::InvalidScript {
            path: path.to_path_buf(),
            message,
        };
        let content = fs::read_to_string(path)?;
        let script: Self = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        script.check().map_err(invalid)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != script.id {
            return Err(invalid(format!(
                "file name does not match script id '{}'",
                script.id
            )));
        }
        Ok(script)
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("script id is empty".to_string());
        }
        if self.id.contains(['/', '\\']) || self.id.starts_with('.') {
            return Err(format!("script id '{}' is not a valid file stem", self.id));
        }
        if self.statements.iter().any(|s| s.trim().is_empty()) {
            return Err("script contains an empty statement".to_string());
        }
        Ok(())
    }
}

/// Builds a script id from a label and a timestamp.
#[must_use]
pub fn script_id(label: &str, at: DateTime<Utc>) -> String {
    let mut slug = String::with_capacity(label.len());
    for ch in label.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "migration" } else { slug };
    format!("{}_{slug}", at.format("%Y%m%d%H%M%S"))
}

/// Where a script stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScriptState {
    /// Recorded as applied.
    Applied {
        /// When it was committed.
        applied_at: DateTime<Utc>,
    },
    /// Newer than the last applied script; the next upgrade runs it.
    Pending,
    /// Older than the last applied script but never run. Upgrades skip it.
    Skipped,
    /// A statement failed.
    Failed {
        /// Driver error message.
        error: String,
    },
    /// The statements ran but the record was not written.
    Unrecorded {
        /// Driver error message.
        error: String,
    },
}

/// One line of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    /// Script id.
    pub id: String,
    /// Script label.
    pub label: String,
    /// Current state.
    #[serde(flatten)]
    pub state: ScriptState,
}

/// Migration state of a database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatusReport {
    /// Id of the most recent applied script.
    pub last_applied: Option<String>,
    /// Every known script, in id order.
    pub scripts: Vec<ScriptStatus>,
    /// Failures that block upgrades.
    pub unresolved: Vec<FailureRecord>,
}

impl StatusReport {
    /// Scripts the next upgrade would run.
    pub fn pending(&self) -> impl Iterator<Item = &ScriptStatus> {
        self.scripts
            .iter()
            .filter(|s| s.state == ScriptState::Pending)
    }

    /// Number of pending scripts.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Whether upgrades are blocked by unresolved failures.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

/// Manages the migration scripts of one connection.
#[derive(Debug)]
pub struct MigrationManager {
    connection: Connection,
    metadata: MetadataStore,
    directory: Option<PathBuf>,
    scripts: BTreeMap<String, MigrationScript>,
    policy: ModifyPolicy,
    allow_destructive: bool,
    dry_run: bool,
}

impl MigrationManager {
    /// Creates a manager with no scripts.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        let metadata = MetadataStore::new(connection.clone());
        Self {
            connection,
            metadata,
            directory: None,
            scripts: BTreeMap::new(),
            policy: ModifyPolicy::default(),
            allow_destructive: false,
            dry_run: false,
        }
    }

    /// Sets the directory scripts are loaded from and written to.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Sets how generated scripts carry out column modifications.
    #[must_use]
    pub const fn with_policy(mut self, policy: ModifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Allows generating scripts that can lose data.
    #[must_use]
    pub const fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Enables dry-run mode (SQL is printed but not executed).
    #[must_use]
    pub const fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// The metadata store.
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Known scripts, in id order.
    pub fn scripts(&self) -> impl Iterator<Item = &MigrationScript> {
        self.scripts.values()
    }

    /// Loads every `*.json` script from the directory. A missing directory
    /// holds no scripts.
    pub fn load(&mut self) -> Result<usize> {
        let Some(directory) = self.directory.clone() else {
            return Ok(0);
        };
        if !directory.exists() {
            return Ok(0);
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let count = paths.len();
        for path in paths {
            self.add_script(MigrationScript::from_file(&path)?)?;
        }
        debug!(directory = %directory.display(), count, "Loaded migration scripts");
        Ok(count)
    }

    /// Registers a script without writing it anywhere.
    pub fn add_script(&mut self, script: MigrationScript) -> Result<()> {
        let path = PathBuf::from(script.file_name());
        script.check().map_err(|message| MigrateError::InvalidScript {
            path: path.clone(),
            message,
        })?;
        if self.scripts.contains_key(&script.id) {
            return Err(MigrateError::InvalidScript {
                path,
                message: format!("duplicate script id '{}'", script.id),
            });
        }
        self.scripts.insert(script.id.clone(), script);
        Ok(())
    }

    /// Creates a script from statements, writing it to the directory if one
    /// is set.
    pub fn create_script(&mut self, label: &str, statements: Vec<String>) -> Result<MigrationScript> {
        let script = MigrationScript::with_id(
            script_id(label, self.next_timestamp()),
            label,
            statements,
        );
        self.add_script(script.clone())?;
        if let Some(directory) = &self.directory {
            fs::create_dir_all(directory)?;
            let path = directory.join(script.file_name());
            fs::write(&path, serde_json::to_string_pretty(&script)?)?;
            info!(id = %script.id, path = %path.display(), "Created migration script");
        }
        Ok(script)
    }

    /// Current time, or one second past the newest known script so that
    /// ids keep sorting in creation order.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let latest = self
            .scripts
            .keys()
            .next_back()
            .and_then(|id| id.get(..14))
            .and_then(|stamp| NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok())
            .map(|naive| naive.and_utc());
        match latest {
            Some(latest) if latest + TimeDelta::seconds(1) > now => latest + TimeDelta::seconds(1),
            _ => now,
        }
    }

    /// Generates a script that moves the live database to `registry`.
    ///
    /// Returns `None` when the database already matches.
    pub async fn generate_with_diff(
        &mut self,
        registry: &SchemaRegistry,
        label: &str,
    ) -> Result<Option<MigrationScript>> {
        let actual = TableIntrospector::new(self.connection.clone())
            .introspect_all()
            .await?;
        let diff = self.diff(registry, &actual)?;
        self.script_from_diff(&diff, label)
    }

    /// Generates a script that moves a database declared by `from` to `to`,
    /// without looking at any live database.
    pub fn generate_upgrade(
        &mut self,
        from: &SchemaRegistry,
        to: &SchemaRegistry,
        label: &str,
    ) -> Result<Option<MigrationScript>> {
        let mut actual = BTreeMap::new();
        for name in from.table_names() {
            actual.insert(name.to_string(), from.prepare(name)?);
        }
        let diff = self.diff(to, &actual)?;
        self.script_from_diff(&diff, label)
    }

    /// Differences between `registry` and the live database.
    pub async fn diff_live(&self, registry: &SchemaRegistry) -> Result<DatabaseDiff> {
        let actual = TableIntrospector::new(self.connection.clone())
            .introspect_all()
            .await?;
        self.diff(registry, &actual)
    }

    fn diff(
        &self,
        registry: &SchemaRegistry,
        actual: &BTreeMap<String, TableSchema>,
    ) -> Result<DatabaseDiff> {
        let diff = SchemaDiffEngine::new(self.connection.dialect())
            .with_policy(self.policy)
            .diff_database(registry, actual, CompileOptions::default())?;
        for report in &diff.reports {
            for warning in &report.warnings {
                warn!(table = %report.table, warning = ?warning, "Change needs a manual migration");
            }
        }
        for table in &diff.unmanaged_tables {
            debug!(table = %table, "Ignoring unmanaged table");
        }
        Ok(diff)
    }

    fn script_from_diff(&mut self, diff: &DatabaseDiff, label: &str) -> Result<Option<MigrationScript>> {
        if diff.is_empty() {
            info!("Database matches the declared schema");
            return Ok(None);
        }
        if diff.has_destructive() && !self.allow_destructive {
            let entries = diff
                .reports
                .iter()
                .flat_map(|r| r.entries.iter())
                .filter(|e| e.destructive)
                .map(|e| format!("{:?} {}.{}", e.operation, e.table, e.column))
                .collect();
            return Err(MigrateError::DestructiveChange(entries));
        }
        self.create_script(label, diff.statements()).map(Some)
    }

    /// Reports every known script and any unresolved failure.
    ///
    /// The metadata table is created if missing.
    pub async fn status(&self) -> Result<StatusReport> {
        self.metadata.ensure_table().await?;
        let applied: BTreeMap<String, MigrationRecord> = self
            .metadata
            .applied_migrations()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let last_applied = applied.keys().next_back().cloned();
        let unresolved = self.metadata.unresolved_failures().await?;

        let scripts = self
            .scripts
            .values()
            .map(|script| {
                let failure = unresolved.iter().find(|f| f.id == script.id);
                let state = match (applied.get(&script.id), failure) {
                    (Some(record), _) => ScriptState::Applied {
                        applied_at: record.applied_at,
                    },
                    (None, Some(f)) if f.state == FailureState::Failed => ScriptState::Failed {
                        error: f.error.clone(),
                    },
                    (None, Some(f)) => ScriptState::Unrecorded {
                        error: f.error.clone(),
                    },
                    (None, None) => {
                        if last_applied.as_deref().is_some_and(|last| script.id.as_str() <= last) {
                            ScriptState::Skipped
                        } else {
                            ScriptState::Pending
                        }
                    }
                };
                ScriptStatus {
                    id: script.id.clone(),
                    label: script.label.clone(),
                    state,
                }
            })
            .collect();

        Ok(StatusReport {
            last_applied,
            scripts,
            unresolved,
        })
    }

    /// Applies pending scripts in id order and returns the ids applied.
    ///
    /// Stops at the first failure. Nothing runs while an earlier failure is
    /// unresolved.
    pub async fn upgrade(&self) -> Result<Vec<String>> {
        let status = self.status().await?;
        if status.is_blocked() {
            let ids = status.unresolved.iter().map(|f| f.id.clone()).collect();
            return Err(MigrateError::MigrationBlocked(ids));
        }

        let pending: Vec<&MigrationScript> = status
            .pending()
            .filter_map(|s| self.scripts.get(&s.id))
            .collect();
        if pending.is_empty() {
            info!("No migrations to apply");
            return Ok(Vec::new());
        }

        let mut applied = Vec::new();
        for script in pending {
            if self.apply(script).await? {
                applied.push(script.id.clone());
            }
        }
        Ok(applied)
    }

    /// Applies one script. Returns `false` if it turned out to be applied
    /// already by a concurrent run.
    async fn apply(&self, script: &MigrationScript) -> Result<bool> {
        info!(id = %script.id, label = %script.label, "Applying migration");

        if self.dry_run {
            for sql in &script.statements {
                println!("{sql};");
            }
            return Ok(true);
        }

        let dialect = self.connection.dialect();
        let mut tx = self.connection.begin().await?;
        sqlx::query(&dialect.lock_table(METADATA_TABLE))
            .execute(&mut *tx)
            .await?;

        let last = last_applied_of(&values_with(&mut *tx, dialect, MIGRATION_KEY).await?)?;
        if last.as_deref().is_some_and(|last| last >= script.id.as_str()) {
            warn!(id = %script.id, "Migration already applied, skipping");
            tx.rollback().await?;
            return Ok(false);
        }

        for sql in &script.statements {
            debug!(sql = %sql, "Executing SQL");
            let outcome = sqlx::query(sql).execute(&mut *tx).await;
            if let Err(source) = outcome {
                if let Err(err) = tx.rollback().await {
                    warn!(id = %script.id, error = %err, "Rollback failed");
                }
                self.mark_failure(script, FailureState::Failed, Some(sql), &source)
                    .await;
                return Err(MigrateError::MigrationFailed {
                    id: script.id.clone(),
                    sql: sql.clone(),
                    source,
                });
            }
        }

        let record = MigrationRecord {
            id: script.id.clone(),
            label: script.label.clone(),
            applied_at: Utc::now(),
        };
        let value = serde_json::to_string(&record)?;
        let recorded = insert_with(&mut *tx, dialect, MIGRATION_KEY, &value).await;
        if let Err(source) = recorded {
            if let Err(err) = tx.rollback().await {
                warn!(id = %script.id, error = %err, "Rollback failed");
            }
            self.mark_failure(script, FailureState::Unrecorded, None, &source)
                .await;
            return Err(MigrateError::MigrationUnrecorded {
                id: script.id.clone(),
                source,
            });
        }
        if let Err(source) = tx.commit().await {
            self.mark_failure(script, FailureState::Unrecorded, None, &source)
                .await;
            return Err(MigrateError::MigrationUnrecorded {
                id: script.id.clone(),
                source,
            });
        }

        info!(id = %script.id, "Applied migration");
        Ok(true)
    }

    async fn mark_failure(
        &self,
        script: &MigrationScript,
        state: FailureState,
        sql: Option<&str>,
        error: &sqlx::Error,
    ) {
        let failure = FailureRecord {
            id: script.id.clone(),
            state,
            sql: sql.map(str::to_string),
            error: error.to_string(),
            at: Utc::now(),
        };
        if let Err(err) = self.metadata.record_failure(&failure).await {
            warn!(id = %script.id, error = %err, "Could not record migration failure");
        }
    }

    /// Records a script as applied without running it, resolving any
    /// failure of it.
    pub async fn mark_applied(&self, id: &str) -> Result<()> {
        let script = self
            .scripts
            .get(id)
            .ok_or_else(|| MigrateError::MigrationNotFound(id.to_string()))?;
        self.metadata.ensure_table().await?;
        self.metadata
            .record_applied(&MigrationRecord {
                id: script.id.clone(),
                label: script.label.clone(),
                applied_at: Utc::now(),
            })
            .await?;
        self.metadata.resolve(id).await?;
        info!(id = %id, "Marked migration as applied");
        Ok(())
    }

    /// Resolves the failure of a script so the next upgrade retries it.
    /// Returns whether a failure was open.
    pub async fn clear_failure(&self, id: &str) -> Result<bool> {
        self.metadata.ensure_table().await?;
        let open = self
            .metadata
            .unresolved_failures()
            .await?
            .iter()
            .any(|f| f.id == id);
        if open {
            self.metadata.resolve(id).await?;
            info!(id = %id, "Cleared migration failure");
        }
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use oxide_schema::datasource::DataSourceConfig;

    use super::*;

    async fn manager() -> MigrationManager {
        let source = DataSourceConfig::from_dsn("sqlite::memory:")
            .normalize("default")
            .unwrap();
        MigrationManager::new(Connection::open(&source).await.unwrap())
    }

    fn script(id: &str, sql: &str) -> MigrationScript {
        MigrationScript::with_id(id, id, vec![sql.to_string()])
    }

    #[test]
    fn test_script_id() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(script_id("Add users!", at), "20240309070501_add_users");
        assert_eq!(script_id("  ", at), "20240309070501_migration");
    }

    #[test]
    fn test_script_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = MigrationScript::with_id("20240101000000_a", "a", vec!["SELECT 1".into()]);
        let path = dir.path().join(script.file_name());
        fs::write(&path, serde_json::to_string(&script).unwrap()).unwrap();
        assert_eq!(MigrationScript::from_file(&path).unwrap(), script);

        let renamed = dir.path().join("other.json");
        fs::rename(&path, &renamed).unwrap();
        assert!(matches!(
            MigrationScript::from_file(&renamed),
            Err(MigrateError::InvalidScript { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let conn = manager().await.connection;

        let mut writer = MigrationManager::new(conn.clone()).with_directory(dir.path());
        let created = writer
            .create_script("init", vec!["CREATE TABLE a (x INTEGER)".into()])
            .unwrap();

        let mut reader = MigrationManager::new(conn).with_directory(dir.path());
        assert_eq!(reader.load().unwrap(), 1);
        assert_eq!(reader.scripts().next(), Some(&created));
    }

    #[tokio::test]
    async fn test_created_ids_keep_creation_order() {
        let mut manager = manager().await;
        let first = manager.create_script("zeta", Vec::new()).unwrap();
        let second = manager.create_script("alpha", Vec::new()).unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_duplicate_script_is_rejected() {
        let mut manager = manager().await;
        manager.add_script(script("1_a", "SELECT 1")).unwrap();
        assert!(manager.add_script(script("1_a", "SELECT 2")).is_err());
    }

    #[tokio::test]
    async fn test_upgrade_applies_in_id_order() {
        let mut manager = manager().await;
        manager
            .add_script(script("20240102_b", "ALTER TABLE t ADD COLUMN y INTEGER"))
            .unwrap();
        manager
            .add_script(script("20240101_a", "CREATE TABLE t (x INTEGER)"))
            .unwrap();

        assert_eq!(manager.status().await.unwrap().pending_count(), 2);
        let applied = manager.upgrade().await.unwrap();
        assert_eq!(applied, vec!["20240101_a", "20240102_b"]);

        let status = manager.status().await.unwrap();
        assert_eq!(status.pending_count(), 0);
        assert_eq!(status.last_applied.as_deref(), Some("20240102_b"));
        assert!(manager.upgrade().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_older_unapplied_script_is_skipped() {
        let mut manager = manager().await;
        manager.add_script(script("2_b", "CREATE TABLE b (x INTEGER)")).unwrap();
        manager.upgrade().await.unwrap();
        manager.add_script(script("1_a", "CREATE TABLE a (x INTEGER)")).unwrap();

        let status = manager.status().await.unwrap();
        assert_eq!(status.scripts[0].state, ScriptState::Skipped);
        assert!(manager.upgrade().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let mut manager = manager().await.dry_run(true);
        manager.add_script(script("1_a", "CREATE TABLE a (x INTEGER)")).unwrap();

        assert_eq!(manager.upgrade().await.unwrap(), vec!["1_a"]);
        assert_eq!(manager.status().await.unwrap().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_applied_unknown_script() {
        let manager = manager().await;
        assert!(matches!(
            manager.mark_applied("nope").await,
            Err(MigrateError::MigrationNotFound(id)) if id == "nope"
        ));
        assert!(!manager.clear_failure("nope").await.unwrap());
    }
}
