//! Migration files on disk.
//!
//! A migrations directory holds `{version}_{name}.up.sql` files and, optionally, the
//! matching `{version}_{name}.down.sql`. Versions are positive integers; files that do not
//! follow the pattern are ignored.

use crate::classify::Classify;
use crate::error::{KitError, KitResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

static MIGRATION_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)_(.+)\.(up|down)\.sql$").expect("valid migration file pattern")
});

/// One schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
}

/// Every known migration, ordered by version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: BTreeMap<i64, Migration>,
}

impl MigrationSet {
    /// Build a set from migrations already in memory.
    pub fn new(migrations: impl IntoIterator<Item = Migration>) -> KitResult<Self> {
        let mut set = BTreeMap::new();
        for migration in migrations {
            if migration.version <= 0 {
                return Err(KitError::generic()
                    .with_message("migration versions start at 1")
                    .with_field("version", migration.version));
            }
            if set.insert(migration.version, migration).is_some() {
                return Err(KitError::generic().with_message("duplicate migration version"));
            }
        }
        Ok(Self { migrations: set })
    }

    /// Load the migrations in `dir`.
    pub fn load(dir: &Path) -> KitResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            e.classify()
                .with_message("cannot read migrations directory")
                .with_field("path", dir.display())
        })?;

        let mut ups: BTreeMap<i64, (String, String)> = BTreeMap::new();
        let mut downs: BTreeMap<i64, String> = BTreeMap::new();

        for entry in entries {
            let entry = entry.map_err(Classify::classify)?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(captures) = MIGRATION_FILE.captures(file_name) else {
                debug!(file = file_name, "Ignoring file in migrations directory");
                continue;
            };

            let version: i64 = captures[1].parse().map_err(|_| {
                KitError::generic()
                    .with_message("migration version out of range")
                    .with_field("file", file_name)
            })?;
            let name = captures[2].to_string();
            let sql = std::fs::read_to_string(entry.path()).map_err(|e| {
                e.classify()
                    .with_message("cannot read migration")
                    .with_field("file", file_name)
            })?;

            let duplicate = match &captures[3] {
                "up" => ups.insert(version, (name, sql)).is_some(),
                _ => downs.insert(version, sql).is_some(),
            };
            if duplicate {
                return Err(KitError::generic()
                    .with_message("duplicate migration version")
                    .with_field("version", version));
            }
        }

        if let Some(orphan) = downs.keys().find(|v| !ups.contains_key(v)) {
            return Err(KitError::generic()
                .with_message("down migration without an up migration")
                .with_field("version", orphan));
        }

        Self::new(ups.into_iter().map(|(version, (name, up))| Migration {
            version,
            name,
            up,
            down: downs.remove(&version),
        }))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn contains(&self, version: i64) -> bool {
        self.migrations.contains_key(&version)
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// Highest known version, 0 when there are none.
    pub fn latest(&self) -> i64 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Greatest version below `version`, 0 when there is none.
    pub fn previous(&self, version: i64) -> i64 {
        self.migrations
            .range(..version)
            .next_back()
            .map(|(v, _)| *v)
            .unwrap_or(0)
    }

    /// Migrations to apply, in order, to go from `current` up to `target`.
    pub fn steps_up(&self, current: i64, target: i64) -> Vec<&Migration> {
        if target <= current {
            return Vec::new();
        }
        self.migrations
            .range(current + 1..=target)
            .map(|(_, m)| m)
            .collect()
    }

    /// Migrations to revert, in order, to go from `current` down to `target`.
    pub fn steps_down(&self, current: i64, target: i64) -> Vec<&Migration> {
        if target >= current {
            return Vec::new();
        }
        self.migrations
            .range(target + 1..=current)
            .rev()
            .map(|(_, m)| m)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(version: i64) -> Migration {
        Migration {
            version,
            name: format!("step_{version}"),
            up: format!("CREATE TABLE t{version} (id INT);"),
            down: Some(format!("DROP TABLE t{version};")),
        }
    }

    fn set() -> MigrationSet {
        MigrationSet::new([1, 2, 3, 5, 8].map(migration)).unwrap()
    }

    #[test]
    fn test_steps_up_are_ascending_and_bounded() {
        let versions: Vec<i64> = set().steps_up(2, 5).iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![3, 5]);
        assert!(set().steps_up(5, 5).is_empty());
        assert!(set().steps_up(5, 2).is_empty());
    }

    #[test]
    fn test_steps_down_are_descending_and_bounded() {
        let versions: Vec<i64> = set().steps_down(8, 2).iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![8, 5, 3]);
        let versions: Vec<i64> = set().steps_down(3, 0).iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn test_previous_and_latest() {
        assert_eq!(set().previous(5), 3);
        assert_eq!(set().previous(1), 0);
        assert_eq!(set().latest(), 8);
        assert_eq!(MigrationSet::default().latest(), 0);
    }

    #[test]
    fn test_rejects_duplicates_and_non_positive_versions() {
        assert!(MigrationSet::new([migration(1), migration(1)]).is_err());
        assert!(MigrationSet::new([migration(0)]).is_err());
    }

    #[test]
    fn test_load_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1_create_users.up.sql"), "CREATE TABLE users (id INT);").unwrap();
        std::fs::write(dir.path().join("1_create_users.down.sql"), "DROP TABLE users;").unwrap();
        std::fs::write(dir.path().join("2_add_email.up.sql"), "ALTER TABLE users ADD email TEXT;").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();

        let set = MigrationSet::load(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
        let first = set.get(1).unwrap();
        assert_eq!(first.name, "create_users");
        assert_eq!(first.down.as_deref(), Some("DROP TABLE users;"));
        assert!(set.get(2).unwrap().down.is_none());
    }

    #[test]
    fn test_load_rejects_orphan_down() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("4_orphan.down.sql"), "SELECT 1;").unwrap();
        let err = MigrationSet::load(dir.path()).unwrap_err();
        assert_eq!(err.field("version"), Some("4"));
    }

    #[test]
    fn test_load_missing_directory_is_not_found() {
        let err = MigrationSet::load(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
