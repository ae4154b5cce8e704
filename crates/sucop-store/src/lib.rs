//! Notice Repository for the SUCOP consultation monitor.
//!
//! Two interchangeable backends behind [`NoticeStore`]: an in-memory
//! store for single-process runs and tests, and a Postgres store where
//! the URL-uniqueness invariant is carried by a unique constraint.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use sucop_core::{
    AlertRecord, Attachment, AttachmentDraft, DeliveryStatus, DocumentKind, Entity, Keyword,
    MergeOutcome, Notice, NoticeDraft, NoticeStatus,
};

pub const CRATE_NAME: &str = "sucop-store";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unknown notice {0}")]
    UnknownNotice(Uuid),
    #[error("unknown keyword {0}")]
    UnknownKeyword(Uuid),
    #[error("unknown alert record {0}")]
    UnknownAlert(Uuid),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Active-notices projection row, joined with display names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveNoticeRow {
    pub notice_id: Uuid,
    pub title: String,
    pub url: String,
    pub entity_name: String,
    pub sector: Option<String>,
    pub status_label: String,
    pub document_label: String,
    pub published_on: NaiveDate,
    pub closes_on: Option<NaiveDate>,
    pub comment_count: i32,
}

/// Upcoming-deadlines projection row, ascending by closing date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlineRow {
    pub notice_id: Uuid,
    pub title: String,
    pub url: String,
    pub entity_name: String,
    pub closes_on: NaiveDate,
    pub days_remaining: i64,
    pub days_in_consultation: i64,
    pub comment_count: i32,
}

/// Canonical store of notices, reference data, tags and the alert log.
///
/// Every method is one short unit of work; a batch or scheduler pass may
/// stop between calls without leaving partial state behind.
#[async_trait]
pub trait NoticeStore: Send + Sync {
    async fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>, StoreError>;
    async fn find_or_create_entity(
        &self,
        name: &str,
        sector: Option<&str>,
    ) -> Result<Entity, StoreError>;

    /// Atomic insert-or-update keyed on the notice URL. Returns the
    /// committed notice together with the merge outcome.
    async fn upsert_notice(
        &self,
        draft: NoticeDraft,
        now: DateTime<Utc>,
    ) -> Result<(Notice, MergeOutcome), StoreError>;
    async fn notice_by_url(&self, url: &str) -> Result<Option<Notice>, StoreError>;
    async fn list_notices(&self) -> Result<Vec<Notice>, StoreError>;
    /// Notices still open for comment and carrying a closing date; the
    /// scan the alert scheduler iterates.
    async fn open_notices_with_deadlines(&self) -> Result<Vec<Notice>, StoreError>;
    /// Removes a notice with its attachments and keyword links. Alert
    /// records are audit log entries and are kept.
    async fn delete_notice(&self, notice_id: Uuid) -> Result<(), StoreError>;

    async fn replace_attachments(
        &self,
        notice_id: Uuid,
        drafts: Vec<AttachmentDraft>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn attachments_for(&self, notice_id: Uuid) -> Result<Vec<Attachment>, StoreError>;

    /// Insert-or-refresh a keyword, unique by text.
    async fn upsert_keyword(
        &self,
        text: &str,
        category: &str,
        weight: i32,
        active: bool,
    ) -> Result<Keyword, StoreError>;
    async fn active_keywords(&self) -> Result<Vec<Keyword>, StoreError>;
    /// Replaces the notice's keyword link set with exactly `keyword_ids`.
    async fn replace_notice_keywords(
        &self,
        notice_id: Uuid,
        keyword_ids: BTreeSet<Uuid>,
    ) -> Result<(), StoreError>;
    async fn notice_keyword_ids(&self, notice_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError>;

    /// Appends an alert record unless one already exists for the same
    /// (rule, notice, window) key. Returns whether a row was written.
    async fn record_alert(&self, record: AlertRecord) -> Result<bool, StoreError>;
    async fn alert_fired(
        &self,
        rule_id: Uuid,
        notice_id: Uuid,
        window_closes_on: NaiveDate,
    ) -> Result<bool, StoreError>;
    async fn list_alert_records(&self) -> Result<Vec<AlertRecord>, StoreError>;
    async fn set_alert_delivery(
        &self,
        alert_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), StoreError>;

    async fn active_notices(&self) -> Result<Vec<ActiveNoticeRow>, StoreError>;
    async fn upcoming_deadlines(&self, today: NaiveDate) -> Result<Vec<DeadlineRow>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemInner {
    entities: HashMap<Uuid, Entity>,
    entity_by_name: HashMap<String, Uuid>,
    notices: HashMap<Uuid, Notice>,
    notice_by_url: HashMap<String, Uuid>,
    attachments: Vec<Attachment>,
    keywords: HashMap<Uuid, Keyword>,
    keyword_by_text: HashMap<String, Uuid>,
    notice_keywords: BTreeSet<(Uuid, Uuid)>,
    alerts: Vec<AlertRecord>,
    alert_windows: HashSet<(Uuid, Uuid, NaiveDate)>,
}

/// In-memory repository. A single writer lock makes each upsert atomic
/// per URL: two overlapping batches can never both insert the same URL.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NoticeStore for MemStore {
    async fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entity_by_name
            .get(name)
            .and_then(|id| inner.entities.get(id))
            .cloned())
    }

    async fn find_or_create_entity(
        &self,
        name: &str,
        sector: Option<&str>,
    ) -> Result<Entity, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.entity_by_name.get(name) {
            let entity = inner.entities[id].clone();
            return Ok(entity);
        }
        let entity = Entity {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sector: sector.map(ToString::to_string),
            created_at: Utc::now(),
        };
        inner.entity_by_name.insert(name.to_string(), entity.id);
        inner.entities.insert(entity.id, entity.clone());
        debug!(entity = %entity.name, "created entity");
        Ok(entity)
    }

    async fn upsert_notice(
        &self,
        draft: NoticeDraft,
        now: DateTime<Utc>,
    ) -> Result<(Notice, MergeOutcome), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.notice_by_url.get(&draft.url).copied() {
            let notice = inner
                .notices
                .get_mut(&id)
                .ok_or(StoreError::UnknownNotice(id))?;
            let changed = notice.diff_against(&draft);
            if changed.is_empty() {
                return Ok((notice.clone(), MergeOutcome::Unchanged));
            }
            notice.apply_draft(&draft, &changed, now);
            return Ok((notice.clone(), MergeOutcome::Updated(changed)));
        }
        let notice = Notice::from_draft(Uuid::new_v4(), &draft, now);
        inner.notice_by_url.insert(notice.url.clone(), notice.id);
        inner.notices.insert(notice.id, notice.clone());
        Ok((notice, MergeOutcome::Created))
    }

    async fn notice_by_url(&self, url: &str) -> Result<Option<Notice>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .notice_by_url
            .get(url)
            .and_then(|id| inner.notices.get(id))
            .cloned())
    }

    async fn list_notices(&self) -> Result<Vec<Notice>, StoreError> {
        let inner = self.inner.read().await;
        let mut notices: Vec<_> = inner.notices.values().cloned().collect();
        notices.sort_by(|a, b| a.published_on.cmp(&b.published_on).then(a.url.cmp(&b.url)));
        Ok(notices)
    }

    async fn open_notices_with_deadlines(&self) -> Result<Vec<Notice>, StoreError> {
        let inner = self.inner.read().await;
        let mut notices: Vec<_> = inner
            .notices
            .values()
            .filter(|n| n.status.is_open() && n.closes_on.is_some())
            .cloned()
            .collect();
        notices.sort_by(|a, b| a.closes_on.cmp(&b.closes_on).then(a.url.cmp(&b.url)));
        Ok(notices)
    }

    async fn delete_notice(&self, notice_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let notice = inner
            .notices
            .remove(&notice_id)
            .ok_or(StoreError::UnknownNotice(notice_id))?;
        inner.notice_by_url.remove(&notice.url);
        inner.attachments.retain(|a| a.notice_id != notice_id);
        inner.notice_keywords.retain(|(n, _)| *n != notice_id);
        Ok(())
    }

    async fn replace_attachments(
        &self,
        notice_id: Uuid,
        drafts: Vec<AttachmentDraft>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.notices.contains_key(&notice_id) {
            return Err(StoreError::UnknownNotice(notice_id));
        }
        inner.attachments.retain(|a| a.notice_id != notice_id);
        for draft in drafts {
            inner.attachments.push(Attachment {
                id: Uuid::new_v4(),
                notice_id,
                filename: draft.filename,
                media_type: draft.media_type,
                url: draft.url,
                extracted_text: draft.extracted_text,
                uploaded_at: now,
            });
        }
        Ok(())
    }

    async fn attachments_for(&self, notice_id: Uuid) -> Result<Vec<Attachment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .attachments
            .iter()
            .filter(|a| a.notice_id == notice_id)
            .cloned()
            .collect())
    }

    async fn upsert_keyword(
        &self,
        text: &str,
        category: &str,
        weight: i32,
        active: bool,
    ) -> Result<Keyword, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.keyword_by_text.get(text).copied() {
            let keyword = inner
                .keywords
                .get_mut(&id)
                .ok_or(StoreError::UnknownKeyword(id))?;
            keyword.category = category.to_string();
            keyword.weight = weight;
            keyword.active = active;
            return Ok(keyword.clone());
        }
        let keyword = Keyword {
            id: Uuid::new_v4(),
            text: text.to_string(),
            category: category.to_string(),
            weight,
            active,
        };
        inner.keyword_by_text.insert(text.to_string(), keyword.id);
        inner.keywords.insert(keyword.id, keyword.clone());
        Ok(keyword)
    }

    async fn active_keywords(&self) -> Result<Vec<Keyword>, StoreError> {
        let inner = self.inner.read().await;
        let mut keywords: Vec<_> = inner
            .keywords
            .values()
            .filter(|k| k.active)
            .cloned()
            .collect();
        keywords.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(keywords)
    }

    async fn replace_notice_keywords(
        &self,
        notice_id: Uuid,
        keyword_ids: BTreeSet<Uuid>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.notices.contains_key(&notice_id) {
            return Err(StoreError::UnknownNotice(notice_id));
        }
        for keyword_id in &keyword_ids {
            if !inner.keywords.contains_key(keyword_id) {
                return Err(StoreError::UnknownKeyword(*keyword_id));
            }
        }
        inner.notice_keywords.retain(|(n, _)| *n != notice_id);
        for keyword_id in keyword_ids {
            inner.notice_keywords.insert((notice_id, keyword_id));
        }
        Ok(())
    }

    async fn notice_keyword_ids(&self, notice_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .notice_keywords
            .iter()
            .filter(|(n, _)| *n == notice_id)
            .map(|(_, k)| *k)
            .collect())
    }

    async fn record_alert(&self, record: AlertRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (record.rule_id, record.notice_id, record.window_closes_on);
        if !inner.alert_windows.insert(key) {
            return Ok(false);
        }
        inner.alerts.push(record);
        Ok(true)
    }

    async fn alert_fired(
        &self,
        rule_id: Uuid,
        notice_id: Uuid,
        window_closes_on: NaiveDate,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .alert_windows
            .contains(&(rule_id, notice_id, window_closes_on)))
    }

    async fn list_alert_records(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.alerts.clone())
    }

    async fn set_alert_delivery(
        &self,
        alert_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or(StoreError::UnknownAlert(alert_id))?;
        record.delivery = status;
        Ok(())
    }

    async fn active_notices(&self) -> Result<Vec<ActiveNoticeRow>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .notices
            .values()
            .filter(|n| n.status == NoticeStatus::Active)
            .map(|n| {
                let entity = inner.entities.get(&n.entity_id);
                ActiveNoticeRow {
                    notice_id: n.id,
                    title: n.title.clone(),
                    url: n.url.clone(),
                    entity_name: entity.map(|e| e.name.clone()).unwrap_or_default(),
                    sector: entity.and_then(|e| e.sector.clone()),
                    status_label: n.status.label().to_string(),
                    document_label: n.document_kind.label().to_string(),
                    published_on: n.published_on,
                    closes_on: n.closes_on,
                    comment_count: n.comment_count,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.published_on.cmp(&a.published_on).then(a.url.cmp(&b.url)));
        Ok(rows)
    }

    async fn upcoming_deadlines(&self, today: NaiveDate) -> Result<Vec<DeadlineRow>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .notices
            .values()
            .filter_map(|n| {
                let closes_on = n.closes_on?;
                if closes_on < today {
                    return None;
                }
                let entity_name = inner
                    .entities
                    .get(&n.entity_id)
                    .map(|e| e.name.clone())
                    .unwrap_or_default();
                Some(DeadlineRow {
                    notice_id: n.id,
                    title: n.title.clone(),
                    url: n.url.clone(),
                    entity_name,
                    closes_on,
                    days_remaining: (closes_on - today).num_days(),
                    days_in_consultation: (closes_on - n.published_on).num_days(),
                    comment_count: n.comment_count,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.closes_on.cmp(&b.closes_on).then(a.url.cmp(&b.url)));
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// Postgres-backed repository. URL uniqueness is a table constraint, so
/// a racing insert from a second batch degrades into the update path.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_entity(row: &sqlx::postgres::PgRow) -> Result<Entity, StoreError> {
    Ok(Entity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_notice(row: &sqlx::postgres::PgRow) -> Result<Notice, StoreError> {
    let status_label: String = row.try_get("status")?;
    let document_label: String = row.try_get("document_kind")?;
    Ok(Notice {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        status: NoticeStatus::parse_label(&status_label).unwrap_or(NoticeStatus::Other),
        document_kind: DocumentKind::parse_label(&document_label).unwrap_or(DocumentKind::Other),
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        published_on: row.try_get("published_on")?,
        closes_on: row.try_get("closes_on")?,
        comment_count: row.try_get("comment_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_alert(row: &sqlx::postgres::PgRow) -> Result<AlertRecord, StoreError> {
    let delivery: String = row.try_get("delivery")?;
    Ok(AlertRecord {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        notice_id: row.try_get("notice_id")?,
        window_closes_on: row.try_get("window_closes_on")?,
        fired_at: row.try_get("fired_at")?,
        message: row.try_get("message")?,
        delivery: DeliveryStatus::parse(&delivery)
            .ok_or_else(|| StoreError::CorruptRow(format!("delivery status `{delivery}`")))?,
    })
}

const NOTICE_COLUMNS: &str = "id, entity_id, status, document_kind, title, url, published_on, \
     closes_on, comment_count, created_at, updated_at";

#[async_trait]
impl NoticeStore for PgStore {
    async fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query("SELECT id, name, sector, created_at FROM entities WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn find_or_create_entity(
        &self,
        name: &str,
        sector: Option<&str>,
    ) -> Result<Entity, StoreError> {
        sqlx::query(
            "INSERT INTO entities (id, name, sector, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(sector)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT id, name, sector, created_at FROM entities WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        row_to_entity(&row)
    }

    async fn upsert_notice(
        &self,
        draft: NoticeDraft,
        now: DateTime<Utc>,
    ) -> Result<(Notice, MergeOutcome), StoreError> {
        let mut tx = self.pool.begin().await?;
        let candidate = Notice::from_draft(Uuid::new_v4(), &draft, now);
        let inserted = sqlx::query(
            "INSERT INTO notices (id, entity_id, status, document_kind, title, url, \
             published_on, closes_on, comment_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (url) DO NOTHING",
        )
        .bind(candidate.id)
        .bind(candidate.entity_id)
        .bind(candidate.status.label())
        .bind(candidate.document_kind.label())
        .bind(&candidate.title)
        .bind(&candidate.url)
        .bind(candidate.published_on)
        .bind(candidate.closes_on)
        .bind(candidate.comment_count)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            return Ok((candidate, MergeOutcome::Created));
        }

        // Lost the insert race or the notice already existed: reconcile
        // against the committed row under a row lock.
        let row = sqlx::query(&format!(
            "SELECT {NOTICE_COLUMNS} FROM notices WHERE url = $1 FOR UPDATE"
        ))
        .bind(&draft.url)
        .fetch_one(&mut *tx)
        .await?;
        let mut notice = row_to_notice(&row)?;
        let changed = notice.diff_against(&draft);
        if changed.is_empty() {
            tx.commit().await?;
            return Ok((notice, MergeOutcome::Unchanged));
        }
        notice.apply_draft(&draft, &changed, now);
        sqlx::query(
            "UPDATE notices SET status = $2, title = $3, closes_on = $4, comment_count = $5, \
             updated_at = $6 WHERE id = $1",
        )
        .bind(notice.id)
        .bind(notice.status.label())
        .bind(&notice.title)
        .bind(notice.closes_on)
        .bind(notice.comment_count)
        .bind(notice.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((notice, MergeOutcome::Updated(changed)))
    }

    async fn notice_by_url(&self, url: &str) -> Result<Option<Notice>, StoreError> {
        let row = sqlx::query(&format!("SELECT {NOTICE_COLUMNS} FROM notices WHERE url = $1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_notice).transpose()
    }

    async fn list_notices(&self) -> Result<Vec<Notice>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTICE_COLUMNS} FROM notices ORDER BY published_on, url"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_notice).collect()
    }

    async fn open_notices_with_deadlines(&self) -> Result<Vec<Notice>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTICE_COLUMNS} FROM notices \
             WHERE status = $1 AND closes_on IS NOT NULL ORDER BY closes_on, url"
        ))
        .bind(NoticeStatus::Active.label())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_notice).collect()
    }

    async fn delete_notice(&self, notice_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM notices WHERE id = $1")
            .bind(notice_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownNotice(notice_id));
        }
        Ok(())
    }

    async fn replace_attachments(
        &self,
        notice_id: Uuid,
        drafts: Vec<AttachmentDraft>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM attachments WHERE notice_id = $1")
            .bind(notice_id)
            .execute(&mut *tx)
            .await?;
        for draft in drafts {
            sqlx::query(
                "INSERT INTO attachments (id, notice_id, filename, media_type, url, \
                 extracted_text, uploaded_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Uuid::new_v4())
            .bind(notice_id)
            .bind(&draft.filename)
            .bind(&draft.media_type)
            .bind(&draft.url)
            .bind(&draft.extracted_text)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn attachments_for(&self, notice_id: Uuid) -> Result<Vec<Attachment>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, notice_id, filename, media_type, url, extracted_text, uploaded_at \
             FROM attachments WHERE notice_id = $1 ORDER BY filename",
        )
        .bind(notice_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Attachment {
                    id: row.try_get("id")?,
                    notice_id: row.try_get("notice_id")?,
                    filename: row.try_get("filename")?,
                    media_type: row.try_get("media_type")?,
                    url: row.try_get("url")?,
                    extracted_text: row.try_get("extracted_text")?,
                    uploaded_at: row.try_get("uploaded_at")?,
                })
            })
            .collect()
    }

    async fn upsert_keyword(
        &self,
        text: &str,
        category: &str,
        weight: i32,
        active: bool,
    ) -> Result<Keyword, StoreError> {
        let row = sqlx::query(
            "INSERT INTO keywords (id, text, category, weight, active) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (text) DO UPDATE \
             SET category = EXCLUDED.category, weight = EXCLUDED.weight, \
                 active = EXCLUDED.active \
             RETURNING id, text, category, weight, active",
        )
        .bind(Uuid::new_v4())
        .bind(text)
        .bind(category)
        .bind(weight)
        .bind(active)
        .fetch_one(&self.pool)
        .await?;
        Ok(Keyword {
            id: row.try_get("id")?,
            text: row.try_get("text")?,
            category: row.try_get("category")?,
            weight: row.try_get("weight")?,
            active: row.try_get("active")?,
        })
    }

    async fn active_keywords(&self) -> Result<Vec<Keyword>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, text, category, weight, active FROM keywords \
             WHERE active ORDER BY text",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Keyword {
                    id: row.try_get("id")?,
                    text: row.try_get("text")?,
                    category: row.try_get("category")?,
                    weight: row.try_get("weight")?,
                    active: row.try_get("active")?,
                })
            })
            .collect()
    }

    async fn replace_notice_keywords(
        &self,
        notice_id: Uuid,
        keyword_ids: BTreeSet<Uuid>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM notice_keywords WHERE notice_id = $1")
            .bind(notice_id)
            .execute(&mut *tx)
            .await?;
        for keyword_id in keyword_ids {
            sqlx::query("INSERT INTO notice_keywords (notice_id, keyword_id) VALUES ($1, $2)")
                .bind(notice_id)
                .bind(keyword_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn notice_keyword_ids(&self, notice_id: Uuid) -> Result<BTreeSet<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT keyword_id FROM notice_keywords WHERE notice_id = $1")
            .bind(notice_id)
            .fetch_all(&self.pool)
            .await?;
        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(row.try_get("keyword_id")?);
        }
        Ok(ids)
    }

    async fn record_alert(&self, record: AlertRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO alert_records (id, rule_id, notice_id, window_closes_on, fired_at, \
             message, delivery) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (rule_id, notice_id, window_closes_on) DO NOTHING",
        )
        .bind(record.id)
        .bind(record.rule_id)
        .bind(record.notice_id)
        .bind(record.window_closes_on)
        .bind(record.fired_at)
        .bind(&record.message)
        .bind(record.delivery.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn alert_fired(
        &self,
        rule_id: Uuid,
        notice_id: Uuid,
        window_closes_on: NaiveDate,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM alert_records \
             WHERE rule_id = $1 AND notice_id = $2 AND window_closes_on = $3",
        )
        .bind(rule_id)
        .bind(notice_id)
        .bind(window_closes_on)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_alert_records(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, notice_id, window_closes_on, fired_at, message, delivery \
             FROM alert_records ORDER BY fired_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_alert).collect()
    }

    async fn set_alert_delivery(
        &self,
        alert_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE alert_records SET delivery = $2 WHERE id = $1")
            .bind(alert_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownAlert(alert_id));
        }
        Ok(())
    }

    async fn active_notices(&self) -> Result<Vec<ActiveNoticeRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT n.id, n.title, n.url, e.name AS entity_name, e.sector, n.status, \
                    n.document_kind, n.published_on, n.closes_on, n.comment_count \
             FROM notices n JOIN entities e ON e.id = n.entity_id \
             WHERE n.status = $1 \
             ORDER BY n.published_on DESC, n.url",
        )
        .bind(NoticeStatus::Active.label())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status_label: String = row.try_get("status")?;
                let document_label: String = row.try_get("document_kind")?;
                Ok(ActiveNoticeRow {
                    notice_id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    url: row.try_get("url")?,
                    entity_name: row.try_get("entity_name")?,
                    sector: row.try_get("sector")?,
                    status_label,
                    document_label,
                    published_on: row.try_get("published_on")?,
                    closes_on: row.try_get("closes_on")?,
                    comment_count: row.try_get("comment_count")?,
                })
            })
            .collect()
    }

    async fn upcoming_deadlines(&self, today: NaiveDate) -> Result<Vec<DeadlineRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT n.id, n.title, n.url, e.name AS entity_name, n.published_on, \
                    n.closes_on, n.comment_count \
             FROM notices n JOIN entities e ON e.id = n.entity_id \
             WHERE n.closes_on >= $1 \
             ORDER BY n.closes_on, n.url",
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let closes_on: NaiveDate = row.try_get("closes_on")?;
                let published_on: NaiveDate = row.try_get("published_on")?;
                Ok(DeadlineRow {
                    notice_id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    url: row.try_get("url")?,
                    entity_name: row.try_get("entity_name")?,
                    closes_on,
                    days_remaining: (closes_on - today).num_days(),
                    days_in_consultation: (closes_on - published_on).num_days(),
                    comment_count: row.try_get("comment_count")?,
                })
            })
            .collect()
    }
}
