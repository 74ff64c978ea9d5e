//! Rebuilds the server's SQLite database from a script before each case.

use crate::errors::GraderError;
use crate::logging::append_run_log;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset { database: PathBuf, batches: usize },
    Skipped(String),
}

pub trait DatabaseReset: Send + Sync {
    fn reset(&self) -> Result<ResetOutcome, GraderError>;
}

#[derive(Debug, Clone)]
pub struct SqliteDatabaseReset {
    settings_path: PathBuf,
    connection_key: String,
    script_path: Option<PathBuf>,
}

impl SqliteDatabaseReset {
    pub fn new(
        settings_path: impl Into<PathBuf>,
        connection_key: impl Into<String>,
        script_path: Option<PathBuf>,
    ) -> Self {
        Self {
            settings_path: settings_path.into(),
            connection_key: connection_key.into(),
            script_path,
        }
    }

    /// `ConnectionStrings.<key>` from the server's JSON settings. Unreadable
    /// or malformed settings count as "no target".
    fn connection_string(&self) -> Option<String> {
        let text = match std::fs::read_to_string(&self.settings_path) {
            Ok(text) => text,
            Err(_) => return None,
        };
        let document: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                append_run_log(
                    "warn",
                    "database.settings.unparsable",
                    json!({
                        "path": self.settings_path.display().to_string(),
                        "error": error.to_string(),
                    }),
                );
                return None;
            }
        };
        document
            .get("ConnectionStrings")?
            .get(&self.connection_key)?
            .as_str()
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Accepts `Data Source=<path>;...` (also `DataSource`/`Filename`) or a bare path.
pub fn parse_data_source(connection: &str) -> Option<String> {
    let trimmed = connection.trim();
    if !trimmed.contains('=') {
        return Some(trimmed.to_string()).filter(|path| !path.is_empty());
    }
    trimmed.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        let key = key.trim().to_ascii_lowercase().replace(' ', "");
        if matches!(key.as_str(), "datasource" | "filename") {
            Some(value.trim().to_string()).filter(|path| !path.is_empty())
        } else {
            None
        }
    })
}

/// Splits on lines that are just `GO`, dropping empty batches.
pub fn split_batches(script: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for line in script.lines() {
        if line.trim().eq_ignore_ascii_case("go") {
            batches.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    batches.push(current);
    batches
        .into_iter()
        .map(|batch| batch.trim().to_string())
        .filter(|batch| !batch.is_empty())
        .collect()
}

fn db_err(error: rusqlite::Error) -> GraderError {
    GraderError::Database(error.to_string())
}

fn rebuild(database: &Path, script: &str) -> Result<usize, GraderError> {
    if database.exists() {
        std::fs::remove_file(database)
            .map_err(|e| GraderError::Database(format!("{}: {e}", database.display())))?;
    }
    if let Some(parent) = database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| GraderError::Database(format!("{}: {e}", parent.display())))?;
    }
    let conn = Connection::open(database).map_err(db_err)?;
    let batches = split_batches(script);
    for batch in &batches {
        conn.execute_batch(batch).map_err(db_err)?;
    }
    Ok(batches.len())
}

impl DatabaseReset for SqliteDatabaseReset {
    fn reset(&self) -> Result<ResetOutcome, GraderError> {
        let Some(connection) = self.connection_string() else {
            return Ok(ResetOutcome::Skipped("no connection target".to_string()));
        };
        let Some(script_path) = &self.script_path else {
            append_run_log(
                "warn",
                "database.reset.skipped",
                json!({
                    "key": self.connection_key,
                    "reason": "connection target found but no database script configured",
                }),
            );
            return Ok(ResetOutcome::Skipped("no database script".to_string()));
        };
        let script = std::fs::read_to_string(script_path).map_err(|e| {
            GraderError::Database(format!("database script {}: {e}", script_path.display()))
        })?;
        let source = parse_data_source(&connection).ok_or_else(|| {
            GraderError::Database(format!(
                "connection string '{}' names no database file",
                self.connection_key
            ))
        })?;
        let database = match self.settings_path.parent() {
            Some(base) if Path::new(&source).is_relative() => base.join(&source),
            _ => PathBuf::from(&source),
        };

        let batches = rebuild(&database, &script)?;
        append_run_log(
            "info",
            "database.reset.completed",
            json!({ "database": database.display().to_string(), "batches": batches }),
        );
        Ok(ResetOutcome::Reset { database, batches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_forms() {
        assert_eq!(
            parse_data_source("Data Source=app.db;Cache=Shared").as_deref(),
            Some("app.db")
        );
        assert_eq!(parse_data_source("filename=/tmp/x.db").as_deref(), Some("/tmp/x.db"));
        assert_eq!(parse_data_source("store.sqlite").as_deref(), Some("store.sqlite"));
        assert_eq!(parse_data_source("Server=.;Database=Shop"), None);
        assert_eq!(parse_data_source("  "), None);
    }

    #[test]
    fn go_lines_separate_batches() {
        let script = "CREATE TABLE a (id INTEGER);\ngo\n\n  GO  \nINSERT INTO a VALUES (1);\nGO\n";
        assert_eq!(
            split_batches(script),
            vec!["CREATE TABLE a (id INTEGER);", "INSERT INTO a VALUES (1);"]
        );
    }

    #[test]
    fn reset_recreates_database_from_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = dir.path().join("appsettings.json");
        std::fs::write(
            &settings,
            r#"{"ConnectionStrings":{"MyCnn":"Data Source=data/shop.db"}}"#,
        )
        .expect("settings");
        let script = dir.path().join("seed.sql");
        std::fs::write(
            &script,
            "CREATE TABLE items (name TEXT);\nGO\nINSERT INTO items VALUES ('pen');\n",
        )
        .expect("script");

        let reset = SqliteDatabaseReset::new(&settings, "MyCnn", Some(script));
        let database = dir.path().join("data/shop.db");
        for _ in 0..2 {
            let outcome = reset.reset().expect("reset");
            assert_eq!(
                outcome,
                ResetOutcome::Reset {
                    database: database.clone(),
                    batches: 2
                }
            );
        }

        let conn = Connection::open(&database).expect("open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_target_or_script_skips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let absent = SqliteDatabaseReset::new(dir.path().join("none.json"), "MyCnn", None);
        assert!(matches!(absent.reset(), Ok(ResetOutcome::Skipped(_))));

        let settings = dir.path().join("appsettings.json");
        std::fs::write(&settings, r#"{"ConnectionStrings":{"MyCnn":"x.db"}}"#).expect("settings");
        let no_script = SqliteDatabaseReset::new(&settings, "MyCnn", None);
        assert_eq!(
            no_script.reset().expect("skip"),
            ResetOutcome::Skipped("no database script".to_string())
        );
    }

    #[test]
    fn bad_script_is_a_database_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = dir.path().join("appsettings.json");
        std::fs::write(&settings, r#"{"ConnectionStrings":{"MyCnn":"x.db"}}"#).expect("settings");
        let script = dir.path().join("seed.sql");
        std::fs::write(&script, "CREATE NONSENSE;").expect("script");
        let reset = SqliteDatabaseReset::new(&settings, "MyCnn", Some(script));
        assert!(matches!(reset.reset(), Err(GraderError::Database(_))));
    }
}
