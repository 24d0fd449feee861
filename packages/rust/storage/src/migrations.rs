//! SQL migration definitions for PostForge databases.
//!
//! Two schemas live here: the source store (drafts and unprocessed keywords)
//! and the target store (published documents plus the category/tag
//! taxonomy). Migrations are applied in order on open.

use libsql::{Connection, params};
use postforge_shared::{PostForgeError, Result};

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Source store migrations, in ascending version order.
pub(crate) fn source_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: drafts",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS drafts (
    id                TEXT PRIMARY KEY,
    keyword           TEXT NOT NULL,
    title             TEXT NOT NULL,
    body              TEXT NOT NULL,
    slug              TEXT NOT NULL UNIQUE,
    category_ids      TEXT NOT NULL,
    tag_ids           TEXT NOT NULL,
    image_urls        TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    scheduled_at      TEXT NOT NULL,
    published_at      TEXT,
    target_store      TEXT NOT NULL,
    target_collection TEXT NOT NULL,
    author_id         TEXT,
    word_count        INTEGER NOT NULL,
    language          TEXT NOT NULL,
    requester         TEXT
);

CREATE INDEX IF NOT EXISTS idx_drafts_due ON drafts(status, scheduled_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Unprocessed keywords",
            sql: r#"
CREATE TABLE IF NOT EXISTS unprocessed_keywords (
    id           TEXT PRIMARY KEY,
    keyword      TEXT NOT NULL,
    stage        TEXT NOT NULL,
    error        TEXT NOT NULL,
    context_json TEXT,
    created_at   TEXT NOT NULL,
    status       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_unprocessed_stage ON unprocessed_keywords(stage);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

/// Target store migrations, in ascending version order.
pub(crate) fn target_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: documents, categories, tags",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    collection      TEXT NOT NULL,
    slug            TEXT NOT NULL,
    title           TEXT NOT NULL,
    body            TEXT NOT NULL,
    category_ids    TEXT NOT NULL,
    tag_ids         TEXT NOT NULL,
    image_urls      TEXT NOT NULL,
    author_id       TEXT,
    word_count      INTEGER NOT NULL,
    language        TEXT NOT NULL,
    keyword         TEXT NOT NULL,
    source_draft_id TEXT NOT NULL,
    published_at    TEXT NOT NULL,
    UNIQUE(collection, slug)
);

CREATE TABLE IF NOT EXISTS categories (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS tags (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT ''
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

/// Apply every migration newer than the database's current version.
pub(crate) async fn apply(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    let current_version = schema_version(conn).await;

    for migration in migrations {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                PostForgeError::Storage(format!("migration v{} failed: {e}", migration.version))
            })?;
        }
    }
    Ok(())
}

/// Current schema version, or 0 if no migrations have been applied.
pub(crate) async fn schema_version(conn: &Connection) -> u32 {
    match conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await
    {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        Err(_) => 0, // table doesn't exist yet
    }
}

/// True when a libSQL error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}
