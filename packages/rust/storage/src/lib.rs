//! libSQL storage layer (local files).
//!
//! [`Storage`] is the source store: content drafts awaiting publication and
//! keywords that could not be processed. [`TargetStore`] is a publish
//! destination holding documents and the category/tag taxonomy, and
//! [`TargetRegistry`] resolves target names from config to open stores.
//!
//! **Write rules:**
//! - Drafts are inserted by the pipeline and only ever have their status,
//!   publish time and schedule touched afterwards.
//! - Target stores are written only by the publish scheduler.

mod migrations;
pub mod target;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use postforge_shared::{
    ContentDraft, DraftId, DraftStatus, FailureRecord, PostForgeError, Result, TargetLocator,
    format_timestamp, parse_timestamp,
};

pub use target::{PublishedDocument, TargetRegistry, TargetStore};

/// Source storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

const DRAFT_COLUMNS: &str = "id, keyword, title, body, slug, category_ids, tag_ids, image_urls, \
     status, created_at, scheduled_at, published_at, target_store, target_collection, \
     author_id, word_count, language, requester";

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        let (db, conn) = connect(path).await?;
        migrations::apply(&conn, &migrations::source_migrations()).await?;
        Ok(Self {
            db,
            conn,
            readonly: false,
        })
    }

    /// Open a database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PostForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Draft operations
    // -----------------------------------------------------------------------

    /// Insert a new draft. A slug that already exists yields
    /// [`PostForgeError::DuplicateKey`].
    pub async fn insert_draft(&self, draft: &ContentDraft) -> Result<()> {
        self.check_writable()?;
        let sql = format!(
            "INSERT INTO drafts ({DRAFT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        );
        self.conn
            .execute(
                &sql,
                params![
                    draft.id.to_string(),
                    draft.keyword.as_str(),
                    draft.title.as_str(),
                    draft.body.as_str(),
                    draft.slug.as_str(),
                    to_json(&draft.category_ids)?,
                    to_json(&draft.tag_ids)?,
                    to_json(&draft.image_urls)?,
                    draft.status.as_str(),
                    format_timestamp(&draft.created_at),
                    format_timestamp(&draft.scheduled_at),
                    draft.published_at.as_ref().map(format_timestamp),
                    draft.target.store.as_str(),
                    draft.target.collection.as_str(),
                    draft.author_id.as_deref(),
                    i64::from(draft.word_count),
                    draft.language.as_str(),
                    draft.requester.as_deref(),
                ],
            )
            .await
            .map_err(|e| {
                if migrations::is_unique_violation(&e) {
                    PostForgeError::DuplicateKey {
                        slug: draft.slug.clone(),
                    }
                } else {
                    PostForgeError::Storage(e.to_string())
                }
            })?;
        Ok(())
    }

    /// Get a draft by ID.
    pub async fn get_draft(&self, id: &DraftId) -> Result<Option<ContentDraft>> {
        let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?1");
        self.query_one_draft(&sql, id.to_string()).await
    }

    /// Get a draft by slug.
    pub async fn find_draft_by_slug(&self, slug: &str) -> Result<Option<ContentDraft>> {
        let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE slug = ?1");
        self.query_one_draft(&sql, slug.to_string()).await
    }

    async fn query_one_draft(&self, sql: &str, arg: String) -> Result<Option<ContentDraft>> {
        let mut rows = self
            .conn
            .query(sql, params![arg])
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_draft(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(PostForgeError::Storage(e.to_string())),
        }
    }

    /// List drafts, newest schedule first, optionally filtered by status.
    pub async fn list_drafts(
        &self,
        status: Option<DraftStatus>,
        limit: u32,
    ) -> Result<Vec<ContentDraft>> {
        let mut rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts WHERE status = ?1
                     ORDER BY scheduled_at DESC LIMIT ?2"
                );
                self.conn.query(&sql, params![status.as_str(), limit]).await
            }
            None => {
                let sql = format!(
                    "SELECT {DRAFT_COLUMNS} FROM drafts ORDER BY scheduled_at DESC LIMIT ?1"
                );
                self.conn.query(&sql, params![limit]).await
            }
        }
        .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        collect_drafts(&mut rows).await
    }

    /// Pending drafts due at or before `now`, oldest schedule first.
    pub async fn list_due_drafts(&self, now: DateTime<Utc>) -> Result<Vec<ContentDraft>> {
        let sql = format!(
            "SELECT {DRAFT_COLUMNS} FROM drafts
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC, created_at ASC, id ASC"
        );
        let mut rows = self
            .conn
            .query(&sql, params![format_timestamp(&now)])
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        collect_drafts(&mut rows).await
    }

    /// Move a pending draft's schedule. Returns false if the draft is gone
    /// or already published.
    pub async fn reschedule_draft(&self, id: &DraftId, at: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE drafts SET scheduled_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![format_timestamp(&at), id.to_string()],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Transition a draft pending -> published. Returns false when the draft
    /// was not pending, so a draft is never published twice.
    pub async fn mark_published(&self, id: &DraftId, at: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE drafts SET status = 'published', published_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![format_timestamp(&at), id.to_string()],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Count drafts with the given status.
    pub async fn count_drafts(&self, status: DraftStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM drafts WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map(|v| v as u64).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(PostForgeError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Unprocessed keywords
    // -----------------------------------------------------------------------

    /// Persist a keyword that could not be turned into a draft.
    pub async fn insert_failure(&self, record: &FailureRecord) -> Result<()> {
        self.check_writable()?;
        let context = record
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO unprocessed_keywords (id, keyword, stage, error, context_json, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    record.keyword.as_str(),
                    record.stage.as_str(),
                    record.message.as_str(),
                    context,
                    format_timestamp(&record.created_at),
                    record.status.as_str(),
                ],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent unprocessed keywords first.
    pub async fn list_failures(&self, limit: u32) -> Result<Vec<FailureRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, keyword, stage, error, context_json, created_at, status
                 FROM unprocessed_keywords ORDER BY created_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_failure(&row)?);
        }
        Ok(results)
    }
}

/// Open a libSQL file, creating its parent directory first.
pub(crate) async fn connect(path: &Path) -> Result<(Database, Connection)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PostForgeError::io(parent, e))?;
    }

    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| PostForgeError::Storage(e.to_string()))?;

    let conn = db
        .connect()
        .map_err(|e| PostForgeError::Storage(e.to_string()))?;

    Ok((db, conn))
}

pub(crate) fn to_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).map_err(|e| PostForgeError::Storage(e.to_string()))
}

pub(crate) fn from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| PostForgeError::Storage(format!("invalid list: {e}")))
}

pub(crate) fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| PostForgeError::Storage(e.to_string()))
}

async fn collect_drafts(rows: &mut libsql::Rows) -> Result<Vec<ContentDraft>> {
    let mut results = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        results.push(row_to_draft(&row)?);
    }
    Ok(results)
}

/// Convert a database row (selected with `DRAFT_COLUMNS`) to a [`ContentDraft`].
fn row_to_draft(row: &libsql::Row) -> Result<ContentDraft> {
    let id = get_string(row, 0)?;
    Ok(ContentDraft {
        id: id
            .parse()
            .map_err(|e| PostForgeError::Storage(format!("invalid draft id {id}: {e}")))?,
        keyword: get_string(row, 1)?,
        title: get_string(row, 2)?,
        body: get_string(row, 3)?,
        slug: get_string(row, 4)?,
        category_ids: from_json(&get_string(row, 5)?)?,
        tag_ids: from_json(&get_string(row, 6)?)?,
        image_urls: from_json(&get_string(row, 7)?)?,
        status: get_string(row, 8)?.parse()?,
        created_at: parse_timestamp(&get_string(row, 9)?)?,
        scheduled_at: parse_timestamp(&get_string(row, 10)?)?,
        published_at: row
            .get::<String>(11)
            .ok()
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        target: TargetLocator {
            store: get_string(row, 12)?,
            collection: get_string(row, 13)?,
        },
        author_id: row.get::<String>(14).ok(),
        word_count: row.get::<u32>(15).unwrap_or(0),
        language: get_string(row, 16)?,
        requester: row.get::<String>(17).ok(),
    })
}

fn row_to_failure(row: &libsql::Row) -> Result<FailureRecord> {
    let id = get_string(row, 0)?;
    Ok(FailureRecord {
        id: id
            .parse()
            .map_err(|e| PostForgeError::Storage(format!("invalid failure id {id}: {e}")))?,
        keyword: get_string(row, 1)?,
        stage: get_string(row, 2)?.parse()?,
        message: get_string(row, 3)?,
        context: row
            .get::<String>(4)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: parse_timestamp(&get_string(row, 5)?)?,
        status: get_string(row, 6)?,
    })
}
