//! Publish targets: documents keyed by `(collection, slug)` plus the
//! category/tag taxonomy labels are drawn from.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use postforge_shared::{
    AppConfig, Candidate, ContentDraft, PostForgeError, Result, TargetEntry, TargetWriteMode,
    expand_home, format_timestamp, parse_timestamp,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{connect, from_json, get_string, migrations, to_json};

/// A document as stored in a target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedDocument {
    pub slug: String,
    pub title: String,
    pub body: String,
    pub category_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    pub image_urls: Vec<String>,
    pub author_id: Option<String>,
    pub word_count: u32,
    pub language: String,
    pub keyword: String,
    pub source_draft_id: String,
    pub published_at: DateTime<Utc>,
}

impl PublishedDocument {
    pub fn from_draft(draft: &ContentDraft, published_at: DateTime<Utc>) -> Self {
        Self {
            slug: draft.slug.clone(),
            title: draft.title.clone(),
            body: draft.body.clone(),
            category_ids: draft.category_ids.clone(),
            tag_ids: draft.tag_ids.clone(),
            image_urls: draft.image_urls.clone(),
            author_id: draft.author_id.clone(),
            word_count: draft.word_count,
            language: draft.language.clone(),
            keyword: draft.keyword.clone(),
            source_draft_id: draft.id.to_string(),
            published_at,
        }
    }
}

/// One target database.
pub struct TargetStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    name: String,
    mode: TargetWriteMode,
}

impl TargetStore {
    /// Open or create the target database at `path`.
    pub async fn open(name: &str, path: &Path, mode: TargetWriteMode) -> Result<Self> {
        let (db, conn) = connect(path).await?;
        migrations::apply(&conn, &migrations::target_migrations()).await?;
        Ok(Self {
            db,
            conn,
            name: name.to_string(),
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TargetWriteMode {
        self.mode
    }

    /// Write `doc` into `collection`.
    ///
    /// In [`TargetWriteMode::Upsert`] an existing slug is overwritten in
    /// place. In [`TargetWriteMode::InsertOnly`] it is rejected with
    /// [`PostForgeError::DuplicateKey`].
    pub async fn publish(&self, collection: &str, doc: &PublishedDocument) -> Result<()> {
        let insert = "INSERT INTO documents (id, collection, slug, title, body, category_ids, tag_ids,
                 image_urls, author_id, word_count, language, keyword, source_draft_id, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";
        let sql = match self.mode {
            TargetWriteMode::InsertOnly => insert.to_string(),
            TargetWriteMode::Upsert => format!(
                "{insert}
                 ON CONFLICT(collection, slug) DO UPDATE SET
                   title = excluded.title,
                   body = excluded.body,
                   category_ids = excluded.category_ids,
                   tag_ids = excluded.tag_ids,
                   image_urls = excluded.image_urls,
                   author_id = excluded.author_id,
                   word_count = excluded.word_count,
                   language = excluded.language,
                   keyword = excluded.keyword,
                   source_draft_id = excluded.source_draft_id,
                   published_at = excluded.published_at"
            ),
        };

        self.conn
            .execute(
                &sql,
                params![
                    Uuid::now_v7().to_string(),
                    collection,
                    doc.slug.as_str(),
                    doc.title.as_str(),
                    doc.body.as_str(),
                    to_json(&doc.category_ids)?,
                    to_json(&doc.tag_ids)?,
                    to_json(&doc.image_urls)?,
                    doc.author_id.as_deref(),
                    i64::from(doc.word_count),
                    doc.language.as_str(),
                    doc.keyword.as_str(),
                    doc.source_draft_id.as_str(),
                    format_timestamp(&doc.published_at),
                ],
            )
            .await
            .map_err(|e| {
                if migrations::is_unique_violation(&e) {
                    PostForgeError::DuplicateKey {
                        slug: doc.slug.clone(),
                    }
                } else {
                    PostForgeError::Storage(e.to_string())
                }
            })?;
        Ok(())
    }

    /// Look up a document by slug.
    pub async fn find_by_slug(
        &self,
        collection: &str,
        slug: &str,
    ) -> Result<Option<PublishedDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT slug, title, body, category_ids, tag_ids, image_urls, author_id,
                        word_count, language, keyword, source_draft_id, published_at
                 FROM documents WHERE collection = ?1 AND slug = ?2",
                params![collection, slug],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(PublishedDocument {
                slug: get_string(&row, 0)?,
                title: get_string(&row, 1)?,
                body: get_string(&row, 2)?,
                category_ids: from_json(&get_string(&row, 3)?)?,
                tag_ids: from_json(&get_string(&row, 4)?)?,
                image_urls: from_json(&get_string(&row, 5)?)?,
                author_id: row.get::<String>(6).ok(),
                word_count: row.get::<u32>(7).unwrap_or(0),
                language: get_string(&row, 8)?,
                keyword: get_string(&row, 9)?,
                source_draft_id: get_string(&row, 10)?,
                published_at: parse_timestamp(&get_string(&row, 11)?)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(PostForgeError::Storage(e.to_string())),
        }
    }

    /// Number of documents in `collection`.
    pub async fn count_documents(&self, collection: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
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
    // Taxonomy
    // -----------------------------------------------------------------------

    pub async fn upsert_category(&self, candidate: &Candidate) -> Result<()> {
        self.upsert_label("categories", candidate).await
    }

    pub async fn upsert_tag(&self, candidate: &Candidate) -> Result<()> {
        self.upsert_label("tags", candidate).await
    }

    pub async fn list_categories(&self) -> Result<Vec<Candidate>> {
        self.list_labels("categories").await
    }

    pub async fn list_tags(&self) -> Result<Vec<Candidate>> {
        self.list_labels("tags").await
    }

    async fn upsert_label(&self, table: &str, candidate: &Candidate) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (id, name, description) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description"
        );
        self.conn
            .execute(
                &sql,
                params![
                    candidate.id.as_str(),
                    candidate.name.as_str(),
                    candidate.description.as_str()
                ],
            )
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_labels(&self, table: &str) -> Result<Vec<Candidate>> {
        // rowid order keeps match tie-breaking stable across runs
        let sql = format!("SELECT id, name, description FROM {table} ORDER BY rowid");
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(|e| PostForgeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(Candidate {
                id: get_string(&row, 0)?,
                name: get_string(&row, 1)?,
                description: row.get::<String>(2).unwrap_or_default(),
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Resolves target names to open stores. Stores are opened on first use and
/// kept for the life of the registry.
pub struct TargetRegistry {
    entries: Vec<TargetEntry>,
    open: Mutex<HashMap<String, Arc<TargetStore>>>,
}

impl TargetRegistry {
    pub fn new(entries: Vec<TargetEntry>) -> Self {
        Self {
            entries,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.targets.clone())
    }

    /// Register an already-open store, replacing any entry with its name.
    pub async fn insert(&self, store: TargetStore) -> Arc<TargetStore> {
        let store = Arc::new(store);
        self.open
            .lock()
            .await
            .insert(store.name().to_string(), Arc::clone(&store));
        store
    }

    /// Get the store registered as `name`, opening it if needed.
    pub async fn get(&self, name: &str) -> Result<Arc<TargetStore>> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(name) {
            return Ok(Arc::clone(store));
        }

        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| PostForgeError::NotFound(format!("target store {name:?}")))?;
        let path = expand_home(&entry.path)?;
        tracing::debug!(target_store = name, path = %path.display(), "opening target store");
        let store = Arc::new(TargetStore::open(name, &path, entry.mode).await?);
        open.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }
}
