//! Outbound alerts for HIGH-urgency feedback.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use triage_core::{AnalysisResult, CanonicalRecord};
use triage_http::{HttpClient, HttpError};

pub const ALERT_USERNAME: &str = "Sentiment Alert Bot";
pub const ALERT_ICON: &str = ":warning:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertOutcome {
    Delivered,
    Rejected { status: u16 },
    Failed { reason: String },
}

impl AlertOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, AlertOutcome::Delivered)
    }
}

/// Delivery never raises; failures come back as an outcome.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, message: &str) -> AlertOutcome;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
    username: &'a str,
    icon_emoji: &'a str,
}

/// Posts a Slack-compatible incoming-webhook payload.
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    http: Arc<HttpClient>,
    url: String,
}

impl WebhookAlertChannel {
    pub fn new(http: Arc<HttpClient>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn send(&self, message: &str) -> AlertOutcome {
        let payload = WebhookPayload {
            text: message,
            username: ALERT_USERNAME,
            icon_emoji: ALERT_ICON,
        };
        match self
            .http
            .post_json("alert_webhook", &self.url, &payload, None)
            .await
        {
            Ok(_) => AlertOutcome::Delivered,
            Err(HttpError::HttpStatus { status, .. }) => AlertOutcome::Rejected { status },
            Err(err) => AlertOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }
}

pub fn format_alert_message(record: &CanonicalRecord, analysis: &AnalysisResult) -> String {
    format!(
        "*URGENT CUSTOMER FEEDBACK*\n\n\
         *Feedback ID:* {id}\n\
         *Source:* {source}\n\
         *Timestamp:* {timestamp}\n\n\
         *Sentiment:* {sentiment} (confidence {confidence:.3})\n\
         *Urgency:* {urgency}\n\n\
         *Feedback:*\n\"{text}\"\n\n\
         Please review and respond to this customer promptly.",
        id = record.id,
        source = record.source,
        timestamp = record.timestamp,
        sentiment = analysis.sentiment,
        confidence = analysis.confidence,
        urgency = analysis.urgency,
        text = record.text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use triage_core::{Sentiment, Urgency};
    use triage_http::{HttpClientConfig, RetryPolicy};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> Arc<HttpClient> {
        Arc::new(
            HttpClient::new(HttpClientConfig {
                retry: RetryPolicy::single_attempt(),
                timeout: Duration::from_secs(2),
                ..Default::default()
            })
            .expect("client"),
        )
    }

    fn sample() -> (CanonicalRecord, AnalysisResult) {
        (
            CanonicalRecord {
                id: 123,
                text: "This is a scam! I want my refund now!".into(),
                source: "Twitter".into(),
                timestamp: "2025-10-01 14:30:00".into(),
            },
            AnalysisResult {
                sentiment: Sentiment::Negative,
                confidence: 0.998,
                urgency: Urgency::High,
            },
        )
    }

    #[test]
    fn message_carries_every_record_and_analysis_field() {
        let (record, analysis) = sample();
        let message = format_alert_message(&record, &analysis);
        for needle in [
            "*Feedback ID:* 123",
            "*Source:* Twitter",
            "*Timestamp:* 2025-10-01 14:30:00",
            "*Sentiment:* NEGATIVE (confidence 0.998)",
            "*Urgency:* HIGH",
            "\"This is a scam! I want my refund now!\"",
        ] {
            assert!(message.contains(needle), "missing {needle:?} in {message}");
        }
    }

    #[tokio::test]
    async fn webhook_receives_slack_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/triage"))
            .and(body_json(json!({
                "text": "hello",
                "username": "Sentiment Alert Bot",
                "icon_emoji": ":warning:"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookAlertChannel::new(http(), format!("{}/hooks/triage", server.uri()));
        assert_eq!(channel.send("hello").await, AlertOutcome::Delivered);
    }

    #[tokio::test]
    async fn rejected_webhook_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let channel = WebhookAlertChannel::new(http(), server.uri());
        assert_eq!(
            channel.send("hello").await,
            AlertOutcome::Rejected { status: 404 }
        );
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_failure() {
        let channel = WebhookAlertChannel::new(http(), "http://127.0.0.1:1/hooks/triage");
        let outcome = channel.send("hello").await;
        assert!(matches!(outcome, AlertOutcome::Failed { .. }), "{outcome:?}");
        assert!(!outcome.is_delivered());
    }
}
