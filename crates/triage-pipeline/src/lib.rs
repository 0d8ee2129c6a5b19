//! Batch triage: normalize a table, score each record, classify urgency, alert on HIGH.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use triage_adapters::{InferenceConfig, NormalizeError, RecordNormalizer};
use triage_core::{AnalysisResult, CanonicalRecord, RawTable, Sentiment, TriagedRecord, Urgency};
use triage_http::{HttpClient, HttpClientConfig, RateLimit};
use uuid::Uuid;

pub mod alert;
pub mod scorer;
pub mod urgency;

pub use alert::{format_alert_message, AlertChannel, AlertOutcome, WebhookAlertChannel};
pub use scorer::{HttpSentimentScorer, ScorerError, SentimentScorer, DEFAULT_SCORER_URL};
pub use urgency::{classify, FrequencyRule, UrgencyRules};

pub const CRATE_NAME: &str = "triage-pipeline";

#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub scorer_url: String,
    pub scorer_token: Option<String>,
    /// Requests per second allowed against the scorer; unset means unthrottled.
    pub scorer_max_rps: Option<u32>,
    pub alert_webhook_url: Option<String>,
    pub alerts_enabled: bool,
    pub rules_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_text_avg_len: f64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl TriageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            scorer_url: get("TRIAGE_SCORER_URL").unwrap_or_else(|| DEFAULT_SCORER_URL.to_string()),
            scorer_token: get("TRIAGE_SCORER_TOKEN"),
            scorer_max_rps: get("TRIAGE_SCORER_MAX_RPS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|rps: &u32| *rps > 0),
            alert_webhook_url: get("TRIAGE_ALERT_WEBHOOK_URL"),
            alerts_enabled: get("TRIAGE_ALERTS_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            rules_path: get("TRIAGE_RULES_PATH").map(PathBuf::from),
            user_agent: get("TRIAGE_USER_AGENT").unwrap_or_else(|| "feedback-triage/0.1".to_string()),
            http_timeout_secs: get("TRIAGE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            min_text_avg_len: get("TRIAGE_MIN_TEXT_AVG_LEN")
                .and_then(|v| v.parse().ok())
                .filter(|v: &f64| v.is_finite() && *v >= 0.0)
                .unwrap_or(20.0),
        }
    }

    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            min_text_avg_len: self.min_text_avg_len,
            ..Default::default()
        }
    }

    pub fn urgency_rules(&self) -> Result<UrgencyRules> {
        match &self.rules_path {
            Some(path) => UrgencyRules::from_path(path),
            None => Ok(UrgencyRules::default()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn scorer_http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            rate_limit: self.scorer_max_rps.map(RateLimit::per_second),
            ..self.http_client_config()
        }
    }

    /// Webhook target when alerting is switched on and configured.
    pub fn active_webhook(&self) -> Option<&str> {
        self.alert_webhook_url
            .as_deref()
            .filter(|_| self.alerts_enabled)
    }
}

/// Cooperative cancellation, observed between records.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("normalization failed after reading {rows_read} rows")]
    Normalize {
        rows_read: usize,
        #[source]
        source: NormalizeError,
    },
    #[error("scoring record {record_id} failed after {processed} records were triaged")]
    Scorer {
        record_id: i64,
        processed: usize,
        #[source]
        source: ScorerError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriageCounters {
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
    pub high_urgency: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
}

impl TriageCounters {
    fn record(&mut self, analysis: &AnalysisResult) {
        self.total += 1;
        match analysis.sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Negative => self.negative += 1,
        }
        if analysis.urgency == Urgency::High {
            self.high_urgency += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriageRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub counters: TriageCounters,
    pub records: Vec<TriagedRecord>,
}

pub struct TriagePipeline {
    normalizer: RecordNormalizer,
    rules: UrgencyRules,
    scorer: Arc<dyn SentimentScorer>,
    alerts: Option<Arc<dyn AlertChannel>>,
}

impl TriagePipeline {
    pub fn new(
        normalizer: RecordNormalizer,
        rules: UrgencyRules,
        scorer: Arc<dyn SentimentScorer>,
    ) -> Self {
        Self {
            normalizer,
            rules,
            scorer,
            alerts: None,
        }
    }

    pub fn with_alert_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.alerts = Some(channel);
        self
    }

    /// Wires the HTTP scorer and, when configured, the webhook channel.
    /// Only the scorer's client carries the rate limit.
    pub fn from_config(config: &TriageConfig) -> Result<Self> {
        let scorer = HttpSentimentScorer::new(
            Arc::new(HttpClient::new(config.scorer_http_config())?),
            config.scorer_url.clone(),
            config.scorer_token.clone(),
        );
        info!(
            scorer_url = scorer.url(),
            max_rps = config.scorer_max_rps,
            "sentiment scorer configured"
        );
        let pipeline = Self::new(
            RecordNormalizer::new(config.inference_config()),
            config.urgency_rules()?,
            Arc::new(scorer),
        );
        Ok(match config.active_webhook() {
            Some(url) => {
                let http = Arc::new(HttpClient::new(config.http_client_config())?);
                pipeline.with_alert_channel(Arc::new(WebhookAlertChannel::new(http, url)))
            }
            None => pipeline,
        })
    }

    pub fn normalizer(&self) -> &RecordNormalizer {
        &self.normalizer
    }

    pub fn rules(&self) -> &UrgencyRules {
        &self.rules
    }

    /// Scores one text and layers the urgency rules on top.
    pub async fn analyze(&self, text: &str) -> Result<AnalysisResult, ScorerError> {
        let score = self.scorer.score(text).await?;
        Ok(AnalysisResult {
            sentiment: score.label,
            confidence: score.confidence,
            urgency: self.rules.classify(text, score.label),
        })
    }

    pub async fn run(
        &self,
        table: &RawTable,
        cancel: &CancelFlag,
    ) -> Result<TriageRunSummary, TriageError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("triage_run", %run_id, rows = table.len());
        self.run_inner(run_id, table, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        table: &RawTable,
        cancel: &CancelFlag,
    ) -> Result<TriageRunSummary, TriageError> {
        let started_at = Utc::now();
        let records = self
            .normalizer
            .normalize(table)
            .map_err(|source| TriageError::Normalize {
                rows_read: table.len(),
                source,
            })?;

        let mut counters = TriageCounters::default();
        let mut triaged = Vec::with_capacity(records.len());
        let mut cancelled = false;

        for record in records {
            if cancel.is_cancelled() {
                info!(processed = triaged.len(), "triage run cancelled");
                cancelled = true;
                break;
            }

            let analysis = self
                .analyze(&record.text)
                .await
                .map_err(|source| TriageError::Scorer {
                    record_id: record.id,
                    processed: triaged.len(),
                    source,
                })?;
            counters.record(&analysis);

            if analysis.urgency == Urgency::High {
                self.dispatch_alert(&record, &analysis, &mut counters).await;
            }
            triaged.push(TriagedRecord { record, analysis });
        }

        info!(
            total = counters.total,
            negative = counters.negative,
            high_urgency = counters.high_urgency,
            alerts_sent = counters.alerts_sent,
            alerts_failed = counters.alerts_failed,
            cancelled,
            "triage run finished"
        );

        Ok(TriageRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            counters,
            records: triaged,
        })
    }

    async fn dispatch_alert(
        &self,
        record: &CanonicalRecord,
        analysis: &AnalysisResult,
        counters: &mut TriageCounters,
    ) {
        let Some(channel) = &self.alerts else {
            return;
        };
        let message = format_alert_message(record, analysis);
        let outcome = channel.send(&message).await;
        if outcome.is_delivered() {
            counters.alerts_sent += 1;
        } else {
            warn!(record_id = record.id, ?outcome, "alert delivery failed");
            counters.alerts_failed += 1;
        }
    }
}
