//! Monitoring pipeline: batch ingestion of scraped registry records,
//! keyword tagging and closing-window alerting, plus per-run reports.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use sucop_core::{
    AlertKind, AlertRecord, AlertRule, DeliveryStatus, Keyword, MergeOutcome, Notice, NoticeDraft,
    RawNoticeRecord, ReferencePolicy, ValidationError,
};
use sucop_store::{NoticeStore, StoreError};

pub const CRATE_NAME: &str = "sucop-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub keywords_path: PathBuf,
    pub alert_rules_path: PathBuf,
    pub reports_dir: PathBuf,
    pub reference_policy: ReferencePolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            keywords_path: std::env::var("SUCOP_KEYWORDS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("keywords.yaml")),
            alert_rules_path: std::env::var("SUCOP_ALERT_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("alert_rules.yaml")),
            reports_dir: std::env::var("SUCOP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            reference_policy: match std::env::var("SUCOP_REFERENCE_POLICY").as_deref() {
                Ok("strict") => ReferencePolicy::Strict,
                _ => ReferencePolicy::AutoCreate,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// YAML registries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct KeywordRegistryFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    keywords: Vec<KeywordEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordEntry {
    text: String,
    category: String,
    #[serde(default = "default_weight")]
    weight: i32,
    #[serde(default = "default_true")]
    active: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct AlertRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<AlertRuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AlertRuleEntry {
    kind: AlertKind,
    description: String,
    message_template: String,
    lead_days: u32,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_weight() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

/// Loads the alert rules file. Rule ids are deterministic so that
/// reloading the file keeps already-fired (rule, notice, window) keys
/// pointing at the same rule.
pub fn load_alert_rules(path: &Path) -> Result<Vec<AlertRule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: AlertRulesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut rules = Vec::with_capacity(file.rules.len());
    for entry in file.rules {
        if entry.lead_days == 0 {
            bail!(
                "alert rule `{}` in {} has a zero-day lead window",
                entry.description,
                path.display()
            );
        }
        rules.push(AlertRule {
            id: AlertRule::deterministic_id(entry.kind, entry.lead_days),
            kind: entry.kind,
            description: entry.description,
            message_template: entry.message_template,
            lead_days: entry.lead_days,
            active: entry.active,
        });
    }
    Ok(rules)
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub url: String,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub url: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub received: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub duplicate_urls_in_batch: usize,
}

/// Shape of the accepted slice of a batch, for the run report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchProfile {
    pub by_status: BTreeMap<String, usize>,
    pub mean_comment_count: f64,
    pub earliest_published: Option<NaiveDate>,
    pub latest_published: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: BatchStats,
    pub profile: BatchProfile,
    pub outcomes: Vec<RecordOutcome>,
    pub rejected: Vec<RejectedRecord>,
}

/// Reconciles one scraped batch into the store. A bad record is
/// collected and skipped; it never aborts the rest of the batch.
pub struct IngestionReconciler {
    policy: ReferencePolicy,
}

impl IngestionReconciler {
    pub fn new(policy: ReferencePolicy) -> Self {
        Self { policy }
    }

    pub async fn ingest_batch(
        &self,
        store: &dyn NoticeStore,
        records: Vec<RawNoticeRecord>,
        now: DateTime<Utc>,
    ) -> Result<BatchReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut stats = BatchStats {
            received: records.len(),
            ..Default::default()
        };
        let mut profile = BatchProfile::default();
        let mut comment_sum = 0i64;
        let mut accepted = 0usize;
        let mut outcomes = Vec::new();
        let mut rejected = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        for (index, raw) in records.into_iter().enumerate() {
            let record_url = Some(raw.url.trim().to_string()).filter(|u| !u.is_empty());
            let validated = match raw.validate(self.policy) {
                Ok(validated) => validated,
                Err(err) => {
                    warn!(index, error = %err, "rejected registry record");
                    stats.rejected += 1;
                    rejected.push(RejectedRecord {
                        index,
                        url: record_url,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            // A repeated URL inside one batch reconciles against the row
            // the first occurrence committed.
            if !seen_urls.insert(validated.url.clone()) {
                stats.duplicate_urls_in_batch += 1;
            }

            let entity = match self.policy {
                ReferencePolicy::AutoCreate => {
                    store
                        .find_or_create_entity(&validated.entity_name, validated.sector.as_deref())
                        .await?
                }
                ReferencePolicy::Strict => {
                    match store.find_entity_by_name(&validated.entity_name).await? {
                        Some(entity) => entity,
                        None => {
                            let err = ValidationError::UnknownReference {
                                kind: "entity",
                                label: validated.entity_name.clone(),
                            };
                            warn!(index, error = %err, "rejected registry record");
                            stats.rejected += 1;
                            rejected.push(RejectedRecord {
                                index,
                                url: record_url,
                                reason: err.to_string(),
                            });
                            continue;
                        }
                    }
                }
            };

            accepted += 1;
            *profile
                .by_status
                .entry(validated.status.label().to_string())
                .or_default() += 1;
            comment_sum += i64::from(validated.comment_count);
            profile.earliest_published = Some(match profile.earliest_published {
                Some(d) => d.min(validated.published_on),
                None => validated.published_on,
            });
            profile.latest_published = Some(match profile.latest_published {
                Some(d) => d.max(validated.published_on),
                None => validated.published_on,
            });

            let draft = NoticeDraft {
                entity_id: entity.id,
                status: validated.status,
                document_kind: validated.document_kind,
                title: validated.title.clone(),
                url: validated.url.clone(),
                published_on: validated.published_on,
                closes_on: validated.closes_on,
                comment_count: validated.comment_count,
            };
            let (notice, outcome) = store.upsert_notice(draft, now).await?;
            match &outcome {
                MergeOutcome::Created => stats.created += 1,
                MergeOutcome::Updated(changed) => {
                    info!(url = %notice.url, ?changed, "notice updated");
                    stats.updated += 1;
                }
                MergeOutcome::Unchanged => stats.unchanged += 1,
            }
            // The attachment set mirrors the latest scrape; a record
            // without attachments leaves the stored set alone.
            if !validated.attachments.is_empty() {
                store
                    .replace_attachments(notice.id, validated.attachments, now)
                    .await?;
            }
            outcomes.push(RecordOutcome {
                url: notice.url,
                outcome,
            });
        }

        if accepted > 0 {
            profile.mean_comment_count = comment_sum as f64 / accepted as f64;
        }
        Ok(BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stats,
            profile,
            outcomes,
            rejected,
        })
    }
}

// ---------------------------------------------------------------------------
// Keyword tagging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TagSummary {
    pub notices: usize,
    pub links: usize,
}

async fn tag_haystack(store: &dyn NoticeStore, notice: &Notice) -> Result<String, StoreError> {
    let mut haystack = notice.title.to_lowercase();
    for attachment in store.attachments_for(notice.id).await? {
        if let Some(text) = attachment.extracted_text {
            haystack.push(' ');
            haystack.push_str(&text.to_lowercase());
        }
    }
    Ok(haystack)
}

/// Recomputes the notice's keyword link set from scratch and replaces
/// it. Matching is case-insensitive substring over the title and the
/// extracted attachment text, so a second pass is a no-op.
pub async fn retag_notice(
    store: &dyn NoticeStore,
    notice: &Notice,
    keywords: &[Keyword],
) -> Result<BTreeSet<Uuid>, StoreError> {
    let haystack = tag_haystack(store, notice).await?;
    let matched: BTreeSet<Uuid> = keywords
        .iter()
        .filter(|keyword| haystack.contains(&keyword.text.to_lowercase()))
        .map(|keyword| keyword.id)
        .collect();
    store
        .replace_notice_keywords(notice.id, matched.clone())
        .await?;
    Ok(matched)
}

pub async fn retag_all(store: &dyn NoticeStore) -> Result<TagSummary, StoreError> {
    let keywords = store.active_keywords().await?;
    let mut summary = TagSummary::default();
    for notice in store.list_notices().await? {
        let matched = retag_notice(store, &notice, &keywords).await?;
        summary.notices += 1;
        summary.links += matched.len();
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown placeholder `{{{0}}}` in alert template")]
    UnknownPlaceholder(String),
    #[error("unterminated placeholder in alert template")]
    Unterminated,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("channel `{channel}` failed: {reason}")]
    Channel {
        channel: &'static str,
        reason: String,
    },
}

/// Where fired alerts go. Delivery failures are recorded on the alert
/// row; the scheduler never retries within a pass.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, record: &AlertRecord) -> Result<(), DeliveryError>;
}

/// Default channel: alerts land in the structured log.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, record: &AlertRecord) -> Result<(), DeliveryError> {
        info!(
            alert_id = %record.id,
            notice_id = %record.notice_id,
            window_closes_on = %record.window_closes_on,
            message = %record.message,
            "alert"
        );
        Ok(())
    }
}

/// Substitutes `{title}`, `{url}`, `{days}` and `{closes_on}` in an
/// alert message template.
pub fn render_alert_message(
    template: &str,
    notice: &Notice,
    closes_on: NaiveDate,
    days_remaining: i64,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or(RenderError::Unterminated)?;
        match &after[..end] {
            "title" => out.push_str(&notice.title),
            "url" => out.push_str(&notice.url),
            "days" => out.push_str(&days_remaining.to_string()),
            "closes_on" => out.push_str(&closes_on.format("%d/%m/%Y").to_string()),
            other => return Err(RenderError::UnknownPlaceholder(other.to_string())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Derived alert state for one (rule, notice) pair. Never stored; it is
/// a pure function of today, the closing date and the fired fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    NotYetEligible,
    Eligible,
    Fired,
    Expired,
}

/// The trigger window is `[closes_on - lead_days, closes_on)`. On the
/// closing date itself the window has passed.
pub fn alert_state(
    today: NaiveDate,
    closes_on: NaiveDate,
    lead_days: u32,
    already_fired: bool,
) -> AlertState {
    if today >= closes_on {
        return AlertState::Expired;
    }
    let window_start = closes_on - Duration::days(i64::from(lead_days));
    if today < window_start {
        return AlertState::NotYetEligible;
    }
    if already_fired {
        AlertState::Fired
    } else {
        AlertState::Eligible
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPassSummary {
    pub today: NaiveDate,
    pub scanned: usize,
    pub fired: usize,
    pub delivered: usize,
    pub failed: usize,
    pub render_failed: usize,
    pub already_fired: usize,
    pub not_yet_eligible: usize,
    pub expired: usize,
}

/// Evaluates active alert rules against the open notices.
pub struct AlertScheduler {
    rules: Vec<AlertRule>,
}

impl AlertScheduler {
    pub fn new(rules: Vec<AlertRule>) -> Result<Self> {
        for rule in &rules {
            if rule.lead_days == 0 {
                bail!("alert rule `{}` has a zero-day lead window", rule.description);
            }
        }
        Ok(Self { rules })
    }

    pub async fn run_pass(
        &self,
        store: &dyn NoticeStore,
        channel: &dyn NotificationChannel,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<AlertPassSummary> {
        let notices = store.open_notices_with_deadlines().await?;
        let mut summary = AlertPassSummary {
            today,
            scanned: notices.len(),
            fired: 0,
            delivered: 0,
            failed: 0,
            render_failed: 0,
            already_fired: 0,
            not_yet_eligible: 0,
            expired: 0,
        };

        for notice in &notices {
            let Some(closes_on) = notice.closes_on else {
                continue;
            };
            for rule in self.rules.iter().filter(|rule| rule.active) {
                let fired = store.alert_fired(rule.id, notice.id, closes_on).await?;
                match alert_state(today, closes_on, rule.lead_days, fired) {
                    AlertState::NotYetEligible => summary.not_yet_eligible += 1,
                    AlertState::Fired => summary.already_fired += 1,
                    AlertState::Expired => summary.expired += 1,
                    AlertState::Eligible => {
                        let days_remaining = (closes_on - today).num_days();
                        // A render failure skips this notice and leaves its
                        // window open; the rest of the pass continues.
                        let message = match render_alert_message(
                            &rule.message_template,
                            notice,
                            closes_on,
                            days_remaining,
                        ) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(
                                    notice_id = %notice.id,
                                    rule = %rule.description,
                                    error = %err,
                                    "alert message render failed"
                                );
                                summary.render_failed += 1;
                                continue;
                            }
                        };
                        let record = AlertRecord {
                            id: Uuid::new_v4(),
                            rule_id: rule.id,
                            notice_id: notice.id,
                            window_closes_on: closes_on,
                            fired_at: now,
                            message,
                            delivery: DeliveryStatus::Pending,
                        };
                        // A concurrent pass may have won this window.
                        if !store.record_alert(record.clone()).await? {
                            summary.already_fired += 1;
                            continue;
                        }
                        summary.fired += 1;
                        match channel.deliver(&record).await {
                            Ok(()) => {
                                store
                                    .set_alert_delivery(record.id, DeliveryStatus::Delivered)
                                    .await?;
                                summary.delivered += 1;
                            }
                            Err(err) => {
                                warn!(alert_id = %record.id, error = %err, "alert delivery failed");
                                store
                                    .set_alert_delivery(record.id, DeliveryStatus::Failed)
                                    .await?;
                                summary.failed += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: BatchStats,
    pub tagged: TagSummary,
    pub alerts: AlertPassSummary,
    pub reports_dir: String,
}

pub struct MonitorPipeline {
    config: PipelineConfig,
    store: Arc<dyn NoticeStore>,
    channel: Arc<dyn NotificationChannel>,
}

impl MonitorPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn NoticeStore>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            config,
            store,
            channel,
        }
    }

    pub fn store(&self) -> &Arc<dyn NoticeStore> {
        &self.store
    }

    /// Pushes the keyword registry file into the store, unique by text.
    pub async fn sync_keyword_registry(&self) -> Result<usize> {
        let path = &self.config.keywords_path;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: KeywordRegistryFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let count = file.keywords.len();
        for entry in file.keywords {
            self.store
                .upsert_keyword(&entry.text, &entry.category, entry.weight, entry.active)
                .await?;
        }
        Ok(count)
    }

    /// One full monitoring run: sync the keyword registry, reconcile the
    /// batch, retag the touched notices, run an alert pass and write the
    /// run report files.
    pub async fn run_once(
        &self,
        records: Vec<RawNoticeRecord>,
        today: NaiveDate,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.sync_keyword_registry().await?;
        let reconciler = IngestionReconciler::new(self.config.reference_policy);
        let batch = reconciler
            .ingest_batch(self.store.as_ref(), records, started_at)
            .instrument(info_span!("ingest", %run_id))
            .await?;

        let keywords = self.store.active_keywords().await?;
        let mut tagged = TagSummary::default();
        let touched: BTreeSet<&str> = batch
            .outcomes
            .iter()
            .filter(|outcome| !matches!(outcome.outcome, MergeOutcome::Unchanged))
            .map(|outcome| outcome.url.as_str())
            .collect();
        for url in touched {
            if let Some(notice) = self.store.notice_by_url(url).await? {
                let matched = retag_notice(self.store.as_ref(), &notice, &keywords).await?;
                tagged.notices += 1;
                tagged.links += matched.len();
            }
        }

        let rules = load_alert_rules(&self.config.alert_rules_path)?;
        let scheduler = AlertScheduler::new(rules)?;
        let alerts = scheduler
            .run_pass(self.store.as_ref(), self.channel.as_ref(), today, Utc::now())
            .instrument(info_span!("alert_pass", %run_id))
            .await?;

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, &batch, &tagged, &alerts)
            .await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            stats: batch.stats,
            tagged,
            alerts,
            reports_dir: reports_dir.display().to_string(),
        })
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        batch: &BatchReport,
        tagged: &TagSummary,
        alerts: &AlertPassSummary,
    ) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let ingestion = serde_json::to_vec_pretty(batch).context("serializing batch report")?;
        fs::write(reports_dir.join("ingestion.json"), ingestion)
            .await
            .context("writing ingestion.json")?;

        let alerts_json =
            serde_json::to_vec_pretty(alerts).context("serializing alert pass summary")?;
        fs::write(reports_dir.join("alerts.json"), alerts_json)
            .await
            .context("writing alerts.json")?;

        let brief = format!(
            "# SUCOP Run Brief\n\n- Run ID: `{run_id}`\n- Records received: {}\n- Created: {}\n- Updated: {}\n- Unchanged: {}\n- Rejected: {}\n- Tagged notices: {} ({} links)\n- Alerts fired: {} (delivered {}, failed {})\n",
            batch.stats.received,
            batch.stats.created,
            batch.stats.updated,
            batch.stats.unchanged,
            batch.stats.rejected,
            tagged.notices,
            tagged.links,
            alerts.fired,
            alerts.delivered,
            alerts.failed,
        );
        fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        Ok(reports_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use sucop_core::{AttachmentDraft, DocumentKind, NoticeStatus};
    use sucop_store::MemStore;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 7, 0, 0).single().unwrap()
    }

    fn raw(url: &str, closes_on: &str) -> RawNoticeRecord {
        RawNoticeRecord {
            entity_name: "Ministerio de Agricultura y Desarrollo Rural".into(),
            sector: Some("Agropecuario".into()),
            status: Some("Activa".into()),
            document_kind: Some("Resolución".into()),
            title: "Proyecto de resolución arrocera".into(),
            url: url.into(),
            published_on: Some("10/01/2024".into()),
            closes_on: Some(closes_on.into()),
            comment_count: Some(0),
            attachments: vec![],
        }
    }

    #[derive(Default)]
    struct CollectingChannel {
        messages: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationChannel for CollectingChannel {
        fn name(&self) -> &'static str {
            "collect"
        }

        async fn deliver(&self, record: &AlertRecord) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Channel {
                    channel: "collect",
                    reason: "wired to fail".into(),
                });
            }
            self.messages.lock().unwrap().push(record.message.clone());
            Ok(())
        }
    }

    fn rule(lead_days: u32, template: &str) -> AlertRule {
        AlertRule {
            id: AlertRule::deterministic_id(AlertKind::ClosingSoon, lead_days),
            kind: AlertKind::ClosingSoon,
            description: format!("closing in {lead_days} days"),
            message_template: template.into(),
            lead_days,
            active: true,
        }
    }

    #[test]
    fn alert_state_walks_the_window() {
        let closes = date(2, 10);
        assert_eq!(alert_state(date(1, 20), closes, 5, false), AlertState::NotYetEligible);
        assert_eq!(alert_state(date(2, 5), closes, 5, false), AlertState::Eligible);
        assert_eq!(alert_state(date(2, 9), closes, 5, false), AlertState::Eligible);
        assert_eq!(alert_state(date(2, 9), closes, 5, true), AlertState::Fired);
        // The closing date itself is outside the window.
        assert_eq!(alert_state(date(2, 10), closes, 5, false), AlertState::Expired);
        assert_eq!(alert_state(date(3, 1), closes, 5, true), AlertState::Expired);
    }

    #[test]
    fn message_templates_substitute_known_placeholders() {
        let notice = Notice::from_draft(
            Uuid::new_v4(),
            &NoticeDraft {
                entity_id: Uuid::new_v4(),
                status: NoticeStatus::Active,
                document_kind: DocumentKind::Resolucion,
                title: "Proyecto arrocero".into(),
                url: "https://sucop.gov.co/n/1".into(),
                published_on: date(1, 10),
                closes_on: Some(date(2, 10)),
                comment_count: 0,
            },
            ts(10),
        );
        let rendered = render_alert_message(
            "{title} cierra en {days} días ({closes_on}): {url}",
            &notice,
            date(2, 10),
            3,
        )
        .unwrap();
        assert_eq!(
            rendered,
            "Proyecto arrocero cierra en 3 días (10/02/2024): https://sucop.gov.co/n/1"
        );

        let err = render_alert_message("{titulo}", &notice, date(2, 10), 3).unwrap_err();
        assert!(matches!(err, RenderError::UnknownPlaceholder(ref p) if p == "titulo"));
        let err = render_alert_message("{title", &notice, date(2, 10), 3).unwrap_err();
        assert!(matches!(err, RenderError::Unterminated));
    }

    #[test]
    fn rules_file_rejects_zero_day_lead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert_rules.yaml");
        std::fs::write(
            &path,
            "version: 1\nrules:\n  - kind: closing_soon\n    description: same day\n    message_template: \"{title}\"\n    lead_days: 0\n",
        )
        .unwrap();
        assert!(load_alert_rules(&path).is_err());
    }

    #[test]
    fn rules_file_keeps_deterministic_ids_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert_rules.yaml");
        std::fs::write(
            &path,
            "version: 1\nrules:\n  - kind: closing_soon\n    description: three days out\n    message_template: \"{title}\"\n    lead_days: 3\n",
        )
        .unwrap();
        let first = load_alert_rules(&path).unwrap();
        let second = load_alert_rules(&path).unwrap();
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn batch_collects_rejections_and_keeps_going() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        let mut bad = raw("https://sucop.gov.co/n/2", "10/02/2024");
        bad.published_on = Some("not a date".into());
        let records = vec![raw("https://sucop.gov.co/n/1", "10/02/2024"), bad];

        let report = reconciler.ingest_batch(&store, records, ts(10)).await.unwrap();
        assert_eq!(report.stats.received, 2);
        assert_eq!(report.stats.created, 1);
        assert_eq!(report.stats.rejected, 1);
        assert_eq!(report.rejected[0].index, 1);
        assert!(report.rejected[0].reason.contains("publication date"));
        assert_eq!(store.list_notices().await.unwrap().len(), 1);
        // The profile covers the accepted slice only.
        assert_eq!(report.profile.by_status.get("Activa"), Some(&1));
        assert_eq!(report.profile.earliest_published, Some(date(1, 10)));
        assert_eq!(report.profile.latest_published, Some(date(1, 10)));
    }

    #[tokio::test]
    async fn duplicate_url_in_one_batch_reconciles_against_the_first() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        let first = raw("https://sucop.gov.co/n/3", "10/02/2024");
        let mut second = raw("https://sucop.gov.co/n/3", "10/02/2024");
        second.comment_count = Some(7);

        let report = reconciler
            .ingest_batch(&store, vec![first, second], ts(10))
            .await
            .unwrap();
        assert_eq!(report.stats.created, 1);
        assert_eq!(report.stats.updated, 1);
        assert_eq!(report.stats.duplicate_urls_in_batch, 1);
        assert_eq!(store.list_notices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strict_policy_rejects_unseen_entities() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::Strict);
        let report = reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/4", "10/02/2024")], ts(10))
            .await
            .unwrap();
        assert_eq!(report.stats.rejected, 1);
        assert!(report.rejected[0].reason.contains("entity"));

        store
            .find_or_create_entity("Ministerio de Agricultura y Desarrollo Rural", None)
            .await
            .unwrap();
        let report = reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/4", "10/02/2024")], ts(10))
            .await
            .unwrap();
        assert_eq!(report.stats.created, 1);
    }

    #[tokio::test]
    async fn tagging_scans_attachment_text_and_is_idempotent() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        let mut record = raw("https://sucop.gov.co/n/5", "10/02/2024");
        record.title = "Proyecto de decreto".into();
        record.attachments = vec![AttachmentDraft {
            filename: "memoria.pdf".into(),
            media_type: "application/pdf".into(),
            url: "https://sucop.gov.co/docs/memoria.pdf".into(),
            extracted_text: Some("Impacto sobre el CACAO nacional".into()),
        }];
        reconciler
            .ingest_batch(&store, vec![record], ts(10))
            .await
            .unwrap();
        let cacao = store.upsert_keyword("cacao", "cadenas", 1, true).await.unwrap();
        store.upsert_keyword("arroz", "cadenas", 1, true).await.unwrap();

        let summary = retag_all(&store).await.unwrap();
        assert_eq!(summary.notices, 1);
        assert_eq!(summary.links, 1);
        let notice = store
            .notice_by_url("https://sucop.gov.co/n/5")
            .await
            .unwrap()
            .unwrap();
        let ids = store.notice_keyword_ids(notice.id).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![cacao.id]);

        let again = retag_all(&store).await.unwrap();
        assert_eq!(again.links, 1);
    }

    #[tokio::test]
    async fn inactive_keywords_never_match() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/6", "10/02/2024")], ts(10))
            .await
            .unwrap();
        store.upsert_keyword("arroz", "cadenas", 1, false).await.unwrap();
        let summary = retag_all(&store).await.unwrap();
        assert_eq!(summary.links, 0);
    }

    #[tokio::test]
    async fn alert_pass_fires_once_per_window_and_reopens_on_a_new_date() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/7", "10/02/2024")], ts(10))
            .await
            .unwrap();
        let channel = CollectingChannel::default();
        let scheduler =
            AlertScheduler::new(vec![rule(5, "{title} cierra en {days} días")]).unwrap();

        let pass = scheduler
            .run_pass(&store, &channel, date(2, 7), ts(20))
            .await
            .unwrap();
        assert_eq!(pass.fired, 1);
        assert_eq!(pass.delivered, 1);
        assert_eq!(
            channel.messages.lock().unwrap().as_slice(),
            ["Proyecto de resolución arrocera cierra en 3 días"]
        );

        // Same window the next day: nothing new fires.
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 8), ts(21))
            .await
            .unwrap();
        assert_eq!(pass.fired, 0);
        assert_eq!(pass.already_fired, 1);

        // A moved closing date is a new window.
        let mut moved = raw("https://sucop.gov.co/n/7", "20/02/2024");
        moved.comment_count = Some(0);
        reconciler
            .ingest_batch(&store, vec![moved], ts(22))
            .await
            .unwrap();
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 16), ts(23))
            .await
            .unwrap();
        assert_eq!(pass.fired, 1);
        assert_eq!(store.list_alert_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deactivating_a_keyword_keeps_links_until_the_next_retag() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        let mut record = raw("https://sucop.gov.co/n/10", "10/02/2024");
        record.title = "Consulta sobre el arroz".into();
        reconciler
            .ingest_batch(&store, vec![record], ts(10))
            .await
            .unwrap();
        let arroz = store.upsert_keyword("arroz", "cadenas", 1, true).await.unwrap();
        retag_all(&store).await.unwrap();
        let notice = store
            .notice_by_url("https://sucop.gov.co/n/10")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.notice_keyword_ids(notice.id).await.unwrap().len(), 1);

        // Deactivation alone leaves the existing link in place.
        store.upsert_keyword("arroz", "cadenas", 1, false).await.unwrap();
        let ids = store.notice_keyword_ids(notice.id).await.unwrap();
        assert!(ids.contains(&arroz.id));

        // The next recomputation drops it.
        retag_all(&store).await.unwrap();
        assert!(store.notice_keyword_ids(notice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn render_failure_skips_the_notice_without_aborting_the_pass() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        reconciler
            .ingest_batch(
                &store,
                vec![
                    raw("https://sucop.gov.co/n/11", "10/02/2024"),
                    raw("https://sucop.gov.co/n/12", "11/02/2024"),
                ],
                ts(10),
            )
            .await
            .unwrap();
        let channel = CollectingChannel::default();
        let scheduler = AlertScheduler::new(vec![rule(7, "{no_such_field}")]).unwrap();

        let pass = scheduler
            .run_pass(&store, &channel, date(2, 7), ts(20))
            .await
            .unwrap();
        assert_eq!(pass.render_failed, 2);
        assert_eq!(pass.fired, 0);
        assert!(store.list_alert_records().await.unwrap().is_empty());

        // The windows stay open: a fixed template fires on the next pass.
        let scheduler = AlertScheduler::new(vec![rule(7, "{title}")]).unwrap();
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 7), ts(21))
            .await
            .unwrap();
        assert_eq!(pass.fired, 2);
    }

    #[tokio::test]
    async fn notice_lifecycle_from_first_sighting_to_alert() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);

        // First sighting carries no closing date.
        let report = reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/13", "")], ts(10))
            .await
            .unwrap();
        assert_eq!(report.stats.created, 1);
        let notice = store
            .notice_by_url("https://sucop.gov.co/n/13")
            .await
            .unwrap()
            .unwrap();
        assert!(notice.closes_on.is_none());

        // The registry later publishes the comment-window end.
        let report = reconciler
            .ingest_batch(
                &store,
                vec![raw("https://sucop.gov.co/n/13", "10/02/2024")],
                ts(15),
            )
            .await
            .unwrap();
        assert_eq!(report.stats.updated, 1);
        let notice = store
            .notice_by_url("https://sucop.gov.co/n/13")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.closes_on, Some(date(2, 10)));
        assert_eq!(notice.updated_at, ts(15));

        let channel = CollectingChannel::default();
        let scheduler = AlertScheduler::new(vec![rule(7, "{title}")]).unwrap();
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 3), ts(20))
            .await
            .unwrap();
        assert_eq!(pass.fired, 1);
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 3), ts(20))
            .await
            .unwrap();
        assert_eq!(pass.fired, 0);
        assert_eq!(store.list_alert_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_recorded_and_not_retried() {
        let store = MemStore::new();
        let reconciler = IngestionReconciler::new(ReferencePolicy::AutoCreate);
        reconciler
            .ingest_batch(&store, vec![raw("https://sucop.gov.co/n/8", "10/02/2024")], ts(10))
            .await
            .unwrap();
        let channel = CollectingChannel {
            fail: true,
            ..Default::default()
        };
        let scheduler = AlertScheduler::new(vec![rule(5, "{title}")]).unwrap();

        let pass = scheduler
            .run_pass(&store, &channel, date(2, 7), ts(20))
            .await
            .unwrap();
        assert_eq!(pass.fired, 1);
        assert_eq!(pass.failed, 1);
        let records = store.list_alert_records().await.unwrap();
        assert_eq!(records[0].delivery, DeliveryStatus::Failed);

        // The window is consumed even though delivery failed.
        let pass = scheduler
            .run_pass(&store, &channel, date(2, 8), ts(21))
            .await
            .unwrap();
        assert_eq!(pass.fired, 0);
        assert_eq!(pass.already_fired, 1);
    }

    #[tokio::test]
    async fn run_once_ingests_tags_alerts_and_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("keywords.yaml"),
            "version: 1\nkeywords:\n  - text: arroz\n    category: cadenas\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alert_rules.yaml"),
            "version: 1\nrules:\n  - kind: closing_soon\n    description: three days out\n    message_template: \"{title} cierra en {days} días\"\n    lead_days: 5\n",
        )
        .unwrap();
        let config = PipelineConfig {
            database_url: None,
            keywords_path: dir.path().join("keywords.yaml"),
            alert_rules_path: dir.path().join("alert_rules.yaml"),
            reports_dir: dir.path().join("reports"),
            reference_policy: ReferencePolicy::AutoCreate,
        };
        let store = Arc::new(MemStore::new());
        let channel = Arc::new(CollectingChannel::default());
        let pipeline = MonitorPipeline::new(config, store.clone(), channel.clone());

        let mut record = raw("https://sucop.gov.co/n/9", "10/02/2024");
        record.title = "Consulta sobre el arroz".into();
        let summary = pipeline
            .run_once(vec![record.clone()], date(2, 7))
            .await
            .unwrap();
        assert_eq!(summary.stats.created, 1);
        assert_eq!(summary.tagged.links, 1);
        assert_eq!(summary.alerts.fired, 1);
        assert_eq!(channel.messages.lock().unwrap().len(), 1);

        let reports_dir = PathBuf::from(&summary.reports_dir);
        assert!(reports_dir.join("ingestion.json").exists());
        assert!(reports_dir.join("alerts.json").exists());
        assert!(reports_dir.join("run_brief.md").exists());

        // A second identical run changes nothing and fires nothing.
        let summary = pipeline.run_once(vec![record], date(2, 8)).await.unwrap();
        assert_eq!(summary.stats.unchanged, 1);
        assert_eq!(summary.tagged.notices, 0);
        assert_eq!(summary.alerts.fired, 0);
        assert_eq!(channel.messages.lock().unwrap().len(), 1);
    }
}
