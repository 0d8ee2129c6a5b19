//! Sentiment scoring seam and the hosted-inference HTTP implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use triage_core::{Sentiment, SentimentScore};
use triage_http::{HttpClient, HttpError};

pub const DEFAULT_SCORER_URL: &str =
    "https://api-inference.huggingface.co/models/distilbert-base-uncased-finetuned-sst-2-english";

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("sentiment scorer unreachable: {0}")]
    Transport(#[source] HttpError),
    #[error("sentiment scorer answered with http status {status}")]
    Status { status: u16 },
    #[error("sentiment scorer response could not be decoded: {0}")]
    Decode(String),
    #[error("sentiment scorer returned unknown label {0:?}")]
    UnexpectedLabel(String),
}

impl From<HttpError> for ScorerError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::HttpStatus { status, .. } => ScorerError::Status { status },
            other => ScorerError::Transport(other),
        }
    }
}

/// External capability that labels a text POSITIVE or NEGATIVE with a confidence.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    async fn score(&self, text: &str) -> Result<SentimentScore, ScorerError>;
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct Prediction {
    label: String,
    score: f64,
}

/// Text-classification endpoints answer either flat or nested per input.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Flat(Vec<Prediction>),
    Nested(Vec<Vec<Prediction>>),
}

impl InferenceResponse {
    fn into_predictions(self) -> Vec<Prediction> {
        match self {
            InferenceResponse::Flat(predictions) => predictions,
            InferenceResponse::Nested(batches) => batches.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSentimentScorer {
    http: Arc<HttpClient>,
    url: String,
    token: Option<String>,
}

impl HttpSentimentScorer {
    pub fn new(http: Arc<HttpClient>, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SentimentScorer for HttpSentimentScorer {
    async fn score(&self, text: &str) -> Result<SentimentScore, ScorerError> {
        let response = self
            .http
            .post_json(
                "sentiment_scorer",
                &self.url,
                &InferenceRequest { inputs: text },
                self.token.as_deref(),
            )
            .await?;
        let parsed: InferenceResponse = response
            .json()
            .map_err(|err| ScorerError::Decode(err.to_string()))?;
        let score = best_prediction(parsed.into_predictions())?;
        debug!(label = %score.label, confidence = score.confidence, "scored text");
        Ok(score)
    }
}

fn best_prediction(predictions: Vec<Prediction>) -> Result<SentimentScore, ScorerError> {
    let best = predictions
        .into_iter()
        .filter(|p| p.score.is_finite())
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .ok_or_else(|| ScorerError::Decode("no predictions in response".to_string()))?;
    let label = parse_label(&best.label).ok_or(ScorerError::UnexpectedLabel(best.label))?;
    Ok(SentimentScore {
        label,
        confidence: round_confidence(best.score),
    })
}

/// Accepts named labels and the generic `LABEL_0`/`LABEL_1` binary heads.
fn parse_label(label: &str) -> Option<Sentiment> {
    Sentiment::from_label(label).or_else(|| match label.trim() {
        "LABEL_0" => Some(Sentiment::Negative),
        "LABEL_1" => Some(Sentiment::Positive),
        _ => None,
    })
}

pub fn round_confidence(score: f64) -> f64 {
    ((score * 1000.0).round() / 1000.0).clamp(0.0, 1.0)
}
