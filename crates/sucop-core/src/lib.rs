//! Core domain model for the SUCOP consultation monitor.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sucop-core";

/// Consultation lifecycle status as published by the registry.
///
/// Closed vocabulary with an `Other` escape hatch so downstream match
/// arms stay exhaustive when the registry grows a new label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeStatus {
    Active,
    Closed,
    Finalized,
    Other,
}

impl NoticeStatus {
    /// Canonical registry label (the registry publishes in Spanish).
    pub fn label(&self) -> &'static str {
        match self {
            NoticeStatus::Active => "Activa",
            NoticeStatus::Closed => "Cerrada",
            NoticeStatus::Finalized => "Finalizada",
            NoticeStatus::Other => "Otra",
        }
    }

    /// Parses a registry or English label, case-insensitively.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "activa" | "active" => Some(NoticeStatus::Active),
            "cerrada" | "closed" => Some(NoticeStatus::Closed),
            "finalizada" | "finalized" => Some(NoticeStatus::Finalized),
            "otra" | "other" => Some(NoticeStatus::Other),
            _ => None,
        }
    }

    /// Whether the comment window is still considered open.
    pub fn is_open(&self) -> bool {
        matches!(self, NoticeStatus::Active)
    }
}

/// Kind of regulatory instrument under consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Ain,
    Acuerdo,
    AgendaRegulatoria,
    Auto,
    Conpes,
    Circular,
    Concepto,
    Decreto,
    DirectivaPresidencial,
    Edicto,
    Instruccion,
    Ley,
    Oficio,
    Ordenanza,
    ProblemaAin,
    Resolucion,
    Other,
}

impl DocumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Ain => "AIN",
            DocumentKind::Acuerdo => "Acuerdo",
            DocumentKind::AgendaRegulatoria => "Agenda regulatoria",
            DocumentKind::Auto => "Auto",
            DocumentKind::Conpes => "CONPES",
            DocumentKind::Circular => "Circular",
            DocumentKind::Concepto => "Concepto",
            DocumentKind::Decreto => "Decreto",
            DocumentKind::DirectivaPresidencial => "Directiva Presidencial",
            DocumentKind::Edicto => "Edicto",
            DocumentKind::Instruccion => "Instrucción",
            DocumentKind::Ley => "Ley",
            DocumentKind::Oficio => "Oficio",
            DocumentKind::Ordenanza => "Ordenanza",
            DocumentKind::ProblemaAin => "Problema AIN",
            DocumentKind::Resolucion => "Resolución",
            DocumentKind::Other => "Otro",
        }
    }

    pub fn parse_label(label: &str) -> Option<Self> {
        let needle = label.trim().to_lowercase();
        [
            DocumentKind::Ain,
            DocumentKind::Acuerdo,
            DocumentKind::AgendaRegulatoria,
            DocumentKind::Auto,
            DocumentKind::Conpes,
            DocumentKind::Circular,
            DocumentKind::Concepto,
            DocumentKind::Decreto,
            DocumentKind::DirectivaPresidencial,
            DocumentKind::Edicto,
            DocumentKind::Instruccion,
            DocumentKind::Ley,
            DocumentKind::Oficio,
            DocumentKind::Ordenanza,
            DocumentKind::ProblemaAin,
            DocumentKind::Resolucion,
            DocumentKind::Other,
        ]
        .into_iter()
        .find(|kind| kind.label().to_lowercase() == needle)
    }
}

/// A regulating body that publishes consultations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub sector: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical persisted consultation notice. Identity is the source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub status: NoticeStatus,
    pub document_kind: DocumentKind,
    pub title: String,
    pub url: String,
    pub published_on: NaiveDate,
    pub closes_on: Option<NaiveDate>,
    pub comment_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fully resolved candidate state for one notice, ready to upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeDraft {
    pub entity_id: Uuid,
    pub status: NoticeStatus,
    pub document_kind: DocumentKind,
    pub title: String,
    pub url: String,
    pub published_on: NaiveDate,
    pub closes_on: Option<NaiveDate>,
    pub comment_count: i32,
}

/// The mutable fields a re-ingestion is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeField {
    Title,
    Status,
    ClosesOn,
    CommentCount,
}

/// Per-record outcome of reconciling a scraped record into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "changed", rename_all = "snake_case")]
pub enum MergeOutcome {
    Created,
    Updated(BTreeSet<NoticeField>),
    Unchanged,
}

impl Notice {
    pub fn from_draft(id: Uuid, draft: &NoticeDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_id: draft.entity_id,
            status: draft.status,
            document_kind: draft.document_kind,
            title: draft.title.clone(),
            url: draft.url.clone(),
            published_on: draft.published_on,
            closes_on: draft.closes_on,
            comment_count: draft.comment_count,
            created_at: now,
            updated_at: now,
        }
    }

    /// Field-level diff restricted to the mutable fields. Publication date,
    /// owning entity and document kind are fixed at first ingestion.
    pub fn diff_against(&self, draft: &NoticeDraft) -> BTreeSet<NoticeField> {
        let mut changed = BTreeSet::new();
        if self.title != draft.title {
            changed.insert(NoticeField::Title);
        }
        if self.status != draft.status {
            changed.insert(NoticeField::Status);
        }
        if self.closes_on != draft.closes_on {
            changed.insert(NoticeField::ClosesOn);
        }
        if self.comment_count != draft.comment_count {
            changed.insert(NoticeField::CommentCount);
        }
        changed
    }

    /// Applies the changed fields from `draft` and bumps `updated_at`.
    pub fn apply_draft(
        &mut self,
        draft: &NoticeDraft,
        changed: &BTreeSet<NoticeField>,
        now: DateTime<Utc>,
    ) {
        for field in changed {
            match field {
                NoticeField::Title => self.title = draft.title.clone(),
                NoticeField::Status => self.status = draft.status,
                NoticeField::ClosesOn => self.closes_on = draft.closes_on,
                NoticeField::CommentCount => self.comment_count = draft.comment_count,
            }
        }
        if !changed.is_empty() {
            self.updated_at = now;
        }
    }
}

/// Registry keyword used for strategic classification. Unique by text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: Uuid,
    pub text: String,
    pub category: String,
    pub weight: i32,
    pub active: bool,
}

/// A document attached to a notice, owned by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub notice_id: Uuid,
    pub filename: String,
    pub media_type: String,
    pub url: String,
    pub extracted_text: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDraft {
    pub filename: String,
    pub media_type: String,
    pub url: String,
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ClosingSoon,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ClosingSoon => "closing_soon",
        }
    }
}

/// Configured alert type: fire `lead_days` before the comment window closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub kind: AlertKind,
    pub description: String,
    pub message_template: String,
    pub lead_days: u32,
    pub active: bool,
}

impl AlertRule {
    /// Deterministic rule identity so reloading the rules file keeps
    /// already-fired (rule, notice, window) keys valid.
    pub fn deterministic_id(kind: AlertKind, lead_days: u32) -> Uuid {
        let seed = format!("sucop-alert-rule:{}:{}", kind.as_str(), lead_days);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable alert log entry. Only the delivery status ever changes.
/// `window_closes_on` is the trigger-window identity: a later closing
/// date produces a different key, which re-opens eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub notice_id: Uuid,
    pub window_closes_on: NaiveDate,
    pub fired_at: DateTime<Utc>,
    pub message: String,
    pub delivery: DeliveryStatus,
}

/// How unseen entities and unknown vocabulary labels are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Create unseen entities; map unknown labels to the `Other` variants.
    #[default]
    AutoCreate,
    /// Reject records whose references cannot be resolved.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("malformed publication date `{0}` (expected DD/MM/YYYY)")]
    BadPublicationDate(String),
    #[error("malformed closing date `{0}` (expected DD/MM/YYYY)")]
    BadClosingDate(String),
    #[error("closing date {closes_on} is earlier than publication date {published_on}")]
    ClosingBeforePublication {
        published_on: NaiveDate,
        closes_on: NaiveDate,
    },
    #[error("negative comment count {0}")]
    NegativeCommentCount(i32),
    #[error("unknown {kind} `{label}` rejected by strict reference policy")]
    UnknownReference { kind: &'static str, label: String },
}

/// Raw scraped record as handed over by the scraping collaborator.
/// Field aliases accept the registry crawler's Spanish JSON keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawNoticeRecord {
    #[serde(default, alias = "entidad")]
    pub entity_name: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default, alias = "estado")]
    pub status: Option<String>,
    #[serde(default, alias = "tipo_documento")]
    pub document_kind: Option<String>,
    #[serde(default, alias = "titulo")]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "fecha_publicacion")]
    pub published_on: Option<String>,
    #[serde(default, alias = "fecha_cierre")]
    pub closes_on: Option<String>,
    #[serde(default, alias = "comentarios")]
    pub comment_count: Option<i32>,
    #[serde(default, alias = "adjuntos")]
    pub attachments: Vec<AttachmentDraft>,
}

/// A raw record that passed validation; references still need resolving
/// against the store before it becomes a [`NoticeDraft`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub entity_name: String,
    pub sector: Option<String>,
    pub status: NoticeStatus,
    pub document_kind: DocumentKind,
    pub title: String,
    pub url: String,
    pub published_on: NaiveDate,
    pub closes_on: Option<NaiveDate>,
    pub comment_count: i32,
    pub attachments: Vec<AttachmentDraft>,
}

/// Parses a registry date, `DD/MM/YYYY` first, ISO as a fallback.
pub fn parse_registry_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// Trims and collapses internal whitespace runs to single spaces.
pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl RawNoticeRecord {
    pub fn validate(&self, policy: ReferencePolicy) -> Result<ValidatedRecord, ValidationError> {
        let entity_name = normalize_title(&self.entity_name);
        if entity_name.is_empty() {
            return Err(ValidationError::MissingField("entity_name"));
        }
        let title = normalize_title(&self.title);
        if title.is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if self.url.trim().is_empty() {
            return Err(ValidationError::MissingField("url"));
        }

        let published_raw = self
            .published_on
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField("published_on"))?;
        let published_on = parse_registry_date(published_raw)
            .ok_or_else(|| ValidationError::BadPublicationDate(published_raw.to_string()))?;

        // The crawler emits an empty string when the window has no closing date.
        let closes_on = match self.closes_on.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                parse_registry_date(raw)
                    .ok_or_else(|| ValidationError::BadClosingDate(raw.to_string()))?,
            ),
        };
        if let Some(closes_on) = closes_on {
            if closes_on < published_on {
                return Err(ValidationError::ClosingBeforePublication {
                    published_on,
                    closes_on,
                });
            }
        }

        let status = resolve_label(
            self.status.as_deref(),
            NoticeStatus::Active,
            NoticeStatus::Other,
            NoticeStatus::parse_label,
            "status",
            policy,
        )?;
        let document_kind = resolve_label(
            self.document_kind.as_deref(),
            DocumentKind::Other,
            DocumentKind::Other,
            DocumentKind::parse_label,
            "document kind",
            policy,
        )?;

        let comment_count = self.comment_count.unwrap_or(0);
        if comment_count < 0 {
            return Err(ValidationError::NegativeCommentCount(comment_count));
        }

        Ok(ValidatedRecord {
            entity_name,
            sector: self
                .sector
                .as_deref()
                .map(normalize_title)
                .filter(|s| !s.is_empty()),
            status,
            document_kind,
            title,
            url: self.url.trim().to_string(),
            published_on,
            closes_on,
            comment_count,
            attachments: self.attachments.clone(),
        })
    }
}

fn resolve_label<T>(
    label: Option<&str>,
    missing_default: T,
    unknown_fallback: T,
    parse: impl Fn(&str) -> Option<T>,
    kind: &'static str,
    policy: ReferencePolicy,
) -> Result<T, ValidationError> {
    match label.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(missing_default),
        Some(raw) => match parse(raw) {
            Some(value) => Ok(value),
            None => match policy {
                ReferencePolicy::AutoCreate => Ok(unknown_fallback),
                ReferencePolicy::Strict => Err(ValidationError::UnknownReference {
                    kind,
                    label: raw.to_string(),
                }),
            },
        },
    }
}
