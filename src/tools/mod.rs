//! External collaborators
//!
//! Narrow seams to the outside world: where records come from and where
//! approved publications go. HTTP-backed implementations use reqwest.

use crate::error::OrchestrationError;
use crate::models::{FinancialRecord, PeriodScope};
use crate::publication::DispatchPayload;
use crate::Result;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(30);

//
// ================= Data collection =================
//

/// Source of financial records for a period.
#[async_trait::async_trait]
pub trait DataCollector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self, period: &PeriodScope) -> Result<Vec<FinancialRecord>>;
}

/// Serves a fixed set of records.
pub struct StaticCollector {
    records: Vec<FinancialRecord>,
}

impl StaticCollector {
    pub fn new(records: Vec<FinancialRecord>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl DataCollector for StaticCollector {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn collect(&self, period: &PeriodScope) -> Result<Vec<FinancialRecord>> {
        debug!(period = %period.label(), count = self.records.len(), "Serving static records");
        Ok(self.records.clone())
    }
}

/// Fetches records as JSON from an accounting export endpoint:
/// `GET {base_url}/records?start=YYYY-MM-DD&end=YYYY-MM-DD`.
pub struct HttpCollector {
    client: Client,
    base_url: String,
}

impl HttpCollector {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(COLLECTOR_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl DataCollector for HttpCollector {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn collect(&self, period: &PeriodScope) -> Result<Vec<FinancialRecord>> {
        let url = format!("{}/records", self.base_url);
        let start = period.start.to_string();
        let end = period.end.to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("start", start.as_str()), ("end", end.as_str())])
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::ExternalDependencyError(format!("record export request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::ExternalDependencyError(format!(
                "record export returned {}",
                status
            )));
        }

        let records = response.json::<Vec<FinancialRecord>>().await.map_err(|e| {
            OrchestrationError::ValidationError(format!("record export is not valid JSON records: {}", e))
        })?;

        info!(period = %period.label(), count = records.len(), "Records collected over HTTP");
        Ok(records)
    }
}

//
// ================= Delivery =================
//

/// The single outbound call made for an approved publication.
#[async_trait::async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, payload: &DispatchPayload) -> Result<()>;
}

/// Posts the payload to an automation webhook.
pub struct WebhookDelivery {
    client: Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl DeliveryEndpoint for WebhookDelivery {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, payload: &DispatchPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| OrchestrationError::ExternalDependencyError(format!("webhook call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Webhook rejected dispatch");
            return Err(OrchestrationError::ExternalDependencyError(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }

        info!(action = %payload.action, "Webhook dispatch accepted");
        Ok(())
    }
}

/// Used when no webhook is configured: logs the payload and succeeds.
pub struct LoggingDelivery;

#[async_trait::async_trait]
impl DeliveryEndpoint for LoggingDelivery {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn deliver(&self, payload: &DispatchPayload) -> Result<()> {
        info!(
            action = %payload.action,
            tags = ?payload.data.tags,
            content_length = payload.data.content.len(),
            "No webhook configured, dispatch logged only"
        );
        Ok(())
    }
}

/// Webhook delivery when a URL is given, logging delivery otherwise.
pub fn create_default_delivery(webhook_url: Option<&str>) -> Result<Arc<dyn DeliveryEndpoint>> {
    match webhook_url {
        Some(url) if !url.trim().is_empty() => Ok(Arc::new(WebhookDelivery::new(url.trim())?)),
        _ => Ok(Arc::new(LoggingDelivery)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonetaryAmount, RecordKind};
    use crate::publication::DispatchData;
    use chrono::{NaiveDate, Utc};

    fn record(id: &str) -> FinancialRecord {
        FinancialRecord {
            id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 7, 3).unwrap(),
            kind: RecordKind::Revenue,
            amount: MonetaryAmount::from_cents(10_000),
            category: "consulting".to_string(),
            description: String::new(),
            taxable: true,
            documented: true,
            source: None,
        }
    }

    #[tokio::test]
    async fn test_static_collector_serves_records() {
        let collector = StaticCollector::new(vec![record("r1"), record("r2")]);
        let period = PeriodScope::quarterly(2025, 3).unwrap();

        let records = collector.collect(&period).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(collector.name(), "static");
    }

    #[tokio::test]
    async fn test_default_delivery_without_url_logs() {
        let delivery = create_default_delivery(None).unwrap();
        assert_eq!(delivery.name(), "logging");

        let payload = DispatchPayload {
            action: "publish_facebook".to_string(),
            data: DispatchData {
                content: "Q3 summary".to_string(),
                attachment_reference: None,
                tags: vec!["fiscal".to_string()],
                timestamp: Utc::now(),
            },
        };
        assert!(delivery.deliver(&payload).await.is_ok());

        assert_eq!(create_default_delivery(Some("  ")).unwrap().name(), "logging");
        assert_eq!(
            create_default_delivery(Some("https://hook.example.com/abc")).unwrap().name(),
            "webhook"
        );
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_external_error() {
        let delivery = WebhookDelivery::new("http://127.0.0.1:1/hook").unwrap();
        let payload = DispatchPayload {
            action: "publish_facebook".to_string(),
            data: DispatchData {
                content: "x".to_string(),
                attachment_reference: None,
                tags: Vec::new(),
                timestamp: Utc::now(),
            },
        };

        let err = delivery.deliver(&payload).await.unwrap_err();
        assert!(err.is_transient());
    }
}
