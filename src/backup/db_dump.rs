// pgstash/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};
use which::which;

use crate::config::PostgresConfig;
use crate::errors::{BackupError, Result};

/// Databases every PostgreSQL (or managed PostgreSQL) server carries that are never dumped.
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "defaultdb"];
pub const TEMPLATE_PREFIX: &str = "template";

/// The two external commands the dump stage needs.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Raw `|`-delimited database listing, one row per line.
    async fn list_databases(&self) -> Result<String>;

    /// Dumps `db_name` into `output`. Errors are per-database and recoverable.
    async fn dump_database(&self, db_name: &str, output: &Path) -> Result<()>;
}

/// `psql`/`pg_dump` driven through the libpq environment variables.
pub struct PgDumpTool {
    postgres: PostgresConfig,
}

impl PgDumpTool {
    pub fn new(postgres: PostgresConfig) -> Self {
        PgDumpTool { postgres }
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("PGHOST", &self.postgres.host)
            .env("PGPORT", self.postgres.port.to_string())
            .env("PGUSER", &self.postgres.user)
            .env("PGPASSWORD", &self.postgres.password)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn find_executable(name: &str) -> std::result::Result<PathBuf, String> {
    which(name).map_err(|e| {
        format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed.",
            name, e
        )
    })
}

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn list_databases(&self) -> Result<String> {
        let psql_path = find_executable("psql").map_err(BackupError::Enumeration)?;

        let output = self
            .command(&psql_path)
            .arg("-X") // Do not read psqlrc
            .arg("-l")
            .arg("-t")
            .output()
            .await
            .map_err(|e| BackupError::Enumeration(format!("Failed to execute psql: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::Enumeration(format!(
                "psql -l failed with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn dump_database(&self, db_name: &str, output_file: &Path) -> Result<()> {
        let pg_dump_path = find_executable("pg_dump").map_err(|e| BackupError::dump(db_name, e))?;

        let output = self
            .command(&pg_dump_path)
            .arg("--no-owner")
            .arg("--no-acl")
            .arg(format!("--dbname={}", db_name))
            .arg(format!("--file={}", output_file.display()))
            .output()
            .await
            .map_err(|e| BackupError::dump(db_name, format!("failed to execute pg_dump: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::dump(
                db_name,
                format!(
                    "pg_dump exited with status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

/// Extracts database names from `psql -l -t` output: the first `|` field of each row,
/// trimmed. Blank names (separator rows, wrapped privilege lines) are dropped.
pub fn parse_database_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split('|').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_excluded(db_name: &str, exclusions: &[String]) -> bool {
    db_name.starts_with(TEMPLATE_PREFIX)
        || SYSTEM_DATABASES.contains(&db_name)
        || exclusions.iter().any(|e| e == db_name)
}

/// Lists the databases to back up, in server order, minus system, template and
/// configured exclusions.
pub async fn enumerate_databases(tool: &dyn DumpTool, exclusions: &[String]) -> Result<Vec<String>> {
    let listing = tool.list_databases().await?;
    let databases: Vec<String> = parse_database_listing(&listing)
        .into_iter()
        .filter(|name| {
            let excluded = is_excluded(name, exclusions);
            if excluded {
                info!(db = %name, "Skipping excluded database");
            }
            !excluded
        })
        .collect();

    info!(count = databases.len(), databases = ?databases, "Discovered databases");
    Ok(databases)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub dumped: Vec<String>,
    pub failed: Vec<String>,
}

/// Dumps each database sequentially into `<staging_dir>/<name>.sql`.
///
/// A failing database is logged and skipped, and its partial output removed. Only
/// when nothing at all could be dumped does this fail, with `NoDatabasesDumped`.
pub async fn dump_databases(
    tool: &dyn DumpTool,
    databases: &[String],
    staging_dir: &Path,
) -> Result<DumpSummary> {
    let mut summary = DumpSummary::default();

    for db_name in databases {
        info!(db = %db_name, "Processing database");

        let result = match dump_file_path(staging_dir, db_name) {
            Ok(output_file) => {
                let result = tool.dump_database(db_name, &output_file).await;
                if result.is_err() {
                    remove_partial_dump(&output_file).await;
                }
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(db = %db_name, "Successfully dumped database");
                summary.dumped.push(db_name.clone());
            }
            Err(e) => {
                warn!(db = %db_name, error = %e, "Error dumping database, continuing with the next one");
                summary.failed.push(db_name.clone());
            }
        }
    }

    info!(
        dumped = summary.dumped.len(),
        failed = summary.failed.len(),
        "Database export finished"
    );

    if summary.dumped.is_empty() {
        return Err(BackupError::NoDatabasesDumped);
    }
    Ok(summary)
}

fn dump_file_path(staging_dir: &Path, db_name: &str) -> Result<PathBuf> {
    if db_name.contains(['/', '\\']) || db_name == "." || db_name == ".." {
        return Err(BackupError::dump(db_name, "name cannot be used as a file name"));
    }
    Ok(staging_dir.join(format!("{}.sql", db_name)))
}

async fn remove_partial_dump(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(file = %path.display(), "Removed partial dump"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove partial dump"),
    }
}
