//! `HttpSink`: generic push-based HTTP log store adapter (`spec.md` §4.9.1),
//! generalizing the teacher's `WebhookSink` — POST a JSON batch, classify
//! retryable vs. terminal by status code, and learn `max_acceptable_age`
//! when the destination rejects records as stale.

use std::time::{
    Duration,
    Instant,
};

use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    AUTHORIZATION,
    CONTENT_TYPE,
};
use streamship_common::record::QueueItem;
use streamship_config::SinkConfig;
use tokio::sync::Semaphore;

use crate::{
    encode::encode_batch_json_array,
    Sink,
    SinkErrorKind,
    SinkSendError,
};

/// Response header a destination can set to teach us the oldest record age
/// it will accept, in seconds. No standard exists for this across vendors;
/// this is the one convention the core speaks, matching how `spec.md` §4.9
/// describes the loop generically rather than against one vendor's API.
const MAX_ACCEPTABLE_AGE_HEADER: &str = "x-max-log-age-seconds";

pub struct HttpSink {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    headers: HeaderMap,
    /// Learned from a prior timestamp-rejection response; `None` until the
    /// destination has ever told us otherwise.
    max_acceptable_age: Mutex<Option<Duration>>,
    /// Hard cap on in-flight sends to this destination (`config.max_total`),
    /// enforced here since `reqwest` only caps idle connections, not
    /// concurrent requests, and `max_per_host` collapses to the same bound
    /// as `max_total` for a sink that only ever talks to one endpoint.
    in_flight: Semaphore,
}

impl HttpSink {
    pub fn new(
        name: impl Into<String>,
        endpoint: String,
        extra_headers: &[(String, String)],
        bearer_token: Option<&str>,
        config: &SinkConfig,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle)
            .timeout(config.timeout)
            .build()?;

        let mut headers = HeaderMap::from_iter([(CONTENT_TYPE, HeaderValue::from_static("application/json"))]);
        for (k, v) in extra_headers {
            let name = HeaderName::try_from(k.as_str())?;
            headers.insert(name, HeaderValue::from_str(v)?);
        }
        if let Some(token) = bearer_token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        Ok(Self {
            name: name.into(),
            endpoint,
            client,
            headers,
            max_acceptable_age: Mutex::new(None),
            in_flight: Semaphore::new(config.max_total.max(1)),
        })
    }

    /// Drops records older than a previously-learned acceptable age rather
    /// than sending them only to have them rejected again; returns the
    /// surviving slice (owned, since dropping requires filtering).
    fn clamp_to_learned_age<'a>(&self, batch: &'a [QueueItem], now: Duration) -> Vec<&'a QueueItem> {
        let Some(max_age) = *self.max_acceptable_age.lock() else {
            return batch.iter().collect();
        };
        batch
            .iter()
            .filter(|item| {
                let age = now.saturating_sub(item.record.timestamp);
                if age > max_age {
                    streamship_common::metrics::metrics()
                        .records_dropped_total
                        .with_label_values(&["timestamp_rejected"])
                        .inc();
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    fn learn_max_acceptable_age(&self, headers: &HeaderMap) {
        if let Some(seconds) = headers
            .get(MAX_ACCEPTABLE_AGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            *self.max_acceptable_age.lock() = Some(Duration::from_secs(seconds));
            tracing::warn!(sink = %self.name, max_acceptable_age_secs = seconds, "learned max acceptable record age from destination");
        }
    }
}

#[async_trait::async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &[QueueItem], deadline: Instant) -> Result<(), SinkSendError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| {
            SinkSendError::new(SinkErrorKind::Server, true, "sink is closing".to_string())
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let surviving: Vec<&QueueItem> = self.clamp_to_learned_age(batch, now);
        if surviving.is_empty() {
            return Ok(());
        }
        let surviving: Vec<QueueItem> = surviving.into_iter().cloned().collect();

        let payload = encode_batch_json_array(&surviving)
            .map_err(|e| SinkSendError::new(SinkErrorKind::Client, false, e.to_string()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(payload)
            .timeout(remaining);

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(SinkSendError::timeout(e.to_string())),
            Err(e) => return Err(SinkSendError::transport(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 400 && response.headers().contains_key(MAX_ACCEPTABLE_AGE_HEADER) {
            self.learn_max_acceptable_age(response.headers());
            Err(SinkSendError::new(
                SinkErrorKind::TimestampRejected { max_acceptable_age: *self.max_acceptable_age.lock() },
                false,
                format!("{} rejected batch as too old", self.endpoint),
            ))
        } else {
            let status_u16 = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(SinkSendError::classify_http_status(
                status_u16,
                surviving.len(),
                format!("{} returned {status_u16}: {body}", self.endpoint),
            ))
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use streamship_common::record::{
        Labels,
        Record,
        SourceType,
    };
    use streamship_config::{
        CircuitBreakerConfig,
        SinkKind,
    };

    use super::*;

    fn config(endpoint: &str) -> SinkConfig {
        SinkConfig {
            name: "http".to_string(),
            enabled: true,
            required: true,
            kind: SinkKind::Http {
                endpoint: endpoint.to_string(),
                headers: Vec::new(),
                bearer_token: None,
            },
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
            min_batch: 1,
            max_batch: 1000,
            max_idle: 10,
            max_per_host: 10,
            max_total: 10,
        }
    }

    fn item(age_secs: u64) -> QueueItem {
        let now = Duration::from_secs(1_700_000_000);
        QueueItem::new(
            Record::new(
                now.saturating_sub(Duration::from_secs(age_secs)),
                b"hello".to_vec(),
                SourceType::File,
                Arc::<str>::from("file:a"),
                Labels::new(),
            ),
            Duration::from_secs(0),
        )
    }

    #[test]
    fn clamp_passes_everything_before_any_age_is_learned() {
        let sink = HttpSink::new("http", "https://example.test".to_string(), &[], None, &config("https://example.test")).unwrap();
        let batch = vec![item(0), item(999_999)];
        let now = Duration::from_secs(1_700_000_000);
        assert_eq!(sink.clamp_to_learned_age(&batch, now).len(), 2);
    }

    #[test]
    fn clamp_drops_records_older_than_learned_age() {
        let sink = HttpSink::new("http", "https://example.test".to_string(), &[], None, &config("https://example.test")).unwrap();
        *sink.max_acceptable_age.lock() = Some(Duration::from_secs(60));
        let batch = vec![item(10), item(120)];
        let now = Duration::from_secs(1_700_000_000);
        assert_eq!(sink.clamp_to_learned_age(&batch, now).len(), 1);
    }

    #[test]
    fn status_classification_matches_spec_table() {
        let e = SinkSendError::classify_http_status(429, 5, "rate limited");
        assert!(e.retryable);
        let e = SinkSendError::classify_http_status(503, 5, "unavailable");
        assert!(e.retryable);
        let e = SinkSendError::classify_http_status(404, 5, "not found");
        assert!(!e.retryable);
        let e = SinkSendError::classify_http_status(413, 5, "too large");
        assert!(e.retryable);
        let e = SinkSendError::classify_http_status(413, 1, "too large, single record");
        assert!(!e.retryable);
    }
}
