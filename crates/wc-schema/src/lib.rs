//! Schema declaration and migration runner.
//!
//! Migrations live under `migrations/` as `NNNN_description.sql` files,
//! discovered and applied in numeric order. Each file's checksum is
//! recorded in `__migrations` on first application; a later run whose
//! checksum no longer matches what's on disk is a `ChecksumMismatch`, never
//! a silent re-apply. Applying is idempotent (every `CREATE TABLE`/`INDEX`
//! in the coordination schema is `IF NOT EXISTS`), so running the full set
//! on every process startup is safe.

use std::path::Path;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error reading migration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "checksum mismatch for already-applied migration '{filename}': \
         recorded {recorded}, on-disk {on_disk}"
    )]
    ChecksumMismatch {
        filename: String,
        recorded: String,
        on_disk: String,
    },

    #[error("migration directory '{0}' contains no .sql files")]
    EmptyMigrationSet(String),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

struct MigrationFile {
    filename: String,
    sql: String,
    checksum: String,
}

fn checksum(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

fn discover_migrations(dir: &Path, schema: &str) -> SchemaResult<Vec<MigrationFile>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| SchemaError::Io {
            path: dir.display().to_string(),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "sql").unwrap_or(false))
        .collect();

    entries.sort_by_key(|e| e.file_name());

    if entries.is_empty() {
        return Err(SchemaError::EmptyMigrationSet(dir.display().to_string()));
    }

    entries
        .into_iter()
        .map(|entry| {
            let filename = entry.file_name().to_string_lossy().to_string();
            let raw = std::fs::read_to_string(entry.path()).map_err(|e| SchemaError::Io {
                path: entry.path().display().to_string(),
                source: e,
            })?;
            let sql = raw.replace("__SCHEMA__", schema);
            let checksum = checksum(&sql);
            Ok(MigrationFile {
                filename,
                sql,
                checksum,
            })
        })
        .collect()
}

async fn ensure_migrations_table(pool: &PgPool, schema: &str) -> SchemaResult<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {schema}.__migrations (
            filename TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Apply every migration under `migrations_dir` that hasn't already run,
/// substituting `__SCHEMA__` with `schema`. Safe to call on every process
/// startup.
pub async fn migrate(pool: &PgPool, migrations_dir: &Path, schema: &str) -> SchemaResult<()> {
    ensure_migrations_table(pool, schema).await?;

    let migrations = discover_migrations(migrations_dir, schema)?;
    let applied_table = format!("{schema}.__migrations");

    for migration in migrations {
        let recorded: Option<String> = sqlx::query_scalar(&format!(
            "SELECT checksum FROM {applied_table} WHERE filename = $1"
        ))
        .bind(&migration.filename)
        .fetch_optional(pool)
        .await?;

        match recorded {
            Some(recorded_checksum) if recorded_checksum == migration.checksum => {
                debug!(filename = %migration.filename, "migration already applied, skipping");
                continue;
            }
            Some(recorded_checksum) => {
                return Err(SchemaError::ChecksumMismatch {
                    filename: migration.filename,
                    recorded: recorded_checksum,
                    on_disk: migration.checksum,
                });
            }
            None => {
                info!(filename = %migration.filename, "applying migration");
                let mut tx = pool.begin().await?;
                sqlx::raw_sql(&migration.sql).execute(&mut *tx).await?;
                sqlx::query(&format!(
                    "INSERT INTO {applied_table} (filename, checksum) VALUES ($1, $2)"
                ))
                .bind(&migration.filename)
                .bind(&migration.checksum)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
            }
        }
    }

    info!("schema migrations up to date");
    Ok(())
}

/// Re-checksums every already-applied migration on disk and warns (without
/// failing) about any that no longer exist as a file — distinct from
/// [`migrate`]'s hard failure on a changed-but-still-present file.
pub async fn verify_applied_migrations(
    pool: &PgPool,
    migrations_dir: &Path,
    schema: &str,
) -> SchemaResult<()> {
    let migrations = discover_migrations(migrations_dir, schema)?;
    let by_filename: std::collections::HashMap<_, _> = migrations
        .iter()
        .map(|m| (m.filename.clone(), m.checksum.clone()))
        .collect();

    let applied_table = format!("{schema}.__migrations");
    let rows: Vec<(String, String)> =
        sqlx::query_as(&format!("SELECT filename, checksum FROM {applied_table}"))
            .fetch_all(pool)
            .await?;

    for (filename, recorded_checksum) in rows {
        match by_filename.get(&filename) {
            Some(on_disk) if on_disk == &recorded_checksum => {}
            Some(on_disk) => {
                return Err(SchemaError::ChecksumMismatch {
                    filename,
                    recorded: recorded_checksum,
                    on_disk: on_disk.clone(),
                });
            }
            None => {
                warn!(filename = %filename, "applied migration no longer present on disk");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let a = checksum("select 1;");
        let b = checksum("select 1;");
        let c = checksum("select 2;");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn discover_migrations_sorts_numerically_not_lexicographically() {
        let dir = tempdir();
        std::fs::write(dir.join("0002_second.sql"), "select 2;").unwrap();
        std::fs::write(dir.join("0010_tenth.sql"), "select 10;").unwrap();
        std::fs::write(dir.join("0001_first.sql"), "select 1;").unwrap();

        let migrations = discover_migrations(&dir, "public").unwrap();
        let names: Vec<_> = migrations.iter().map(|m| m.filename.clone()).collect();
        assert_eq!(
            names,
            vec![
                "0001_first.sql".to_string(),
                "0002_second.sql".to_string(),
                "0010_tenth.sql".to_string(),
            ]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn schema_placeholder_is_substituted() {
        let dir = tempdir();
        std::fs::write(dir.join("0001_x.sql"), "CREATE TABLE __SCHEMA__.t (id int);").unwrap();
        let migrations = discover_migrations(&dir, "wc").unwrap();
        assert!(migrations[0].sql.contains("wc.t"));
        assert!(!migrations[0].sql.contains("__SCHEMA__"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wc-schema-test-{}-{}",
            std::process::id(),
            uuid_like_suffix()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn uuid_like_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }
}
