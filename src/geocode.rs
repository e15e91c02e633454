use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::config::AppConfig;
use crate::coordinate::Coordinate;
use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeMatch {
    pub display_name: String,
    pub coordinate: Coordinate,
}

#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<GeocodeMatch>>;
    async fn reverse(&self, coordinate: Coordinate) -> AppResult<Option<String>>;
}

/// Shared front door for forward and reverse geocoding. Every call passes
/// through the rate limiter so the upstream usage policy holds no matter
/// which trigger stream asked.
#[derive(Clone)]
pub struct GeocodeService {
    inner: Arc<dyn GeocodeLookup>,
    rate_limiter: Arc<RateLimiter>,
}

impl GeocodeService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(HttpGeocodeClient::new(config)),
            rate_limiter: Arc::new(RateLimiter::new(config.geocoder_rate_limit_qps)),
        }
    }

    #[cfg(test)]
    pub fn from_lookup(lookup: Arc<dyn GeocodeLookup>, qps: u32) -> Self {
        Self {
            inner: lookup,
            rate_limiter: Arc::new(RateLimiter::new(qps)),
        }
    }

    /// Ordered candidates for a free-text query; empty means no match.
    pub async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<GeocodeMatch>> {
        self.rate_limiter.wait().await;
        self.inner.search(query, limit).await
    }

    /// Best display name for a spot, when the service knows one.
    pub async fn reverse(&self, coordinate: Coordinate) -> AppResult<Option<String>> {
        self.rate_limiter.wait().await;
        self.inner.reverse(coordinate).await
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let safe_qps = qps.max(1);
        let interval_ms = ((1000_f64 / safe_qps as f64).ceil() as u64).max(50);
        Self {
            min_interval: Duration::from_millis(interval_ms),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

struct HttpGeocodeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpGeocodeClient {
    fn new(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(config.http_user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("geocoder http client");
        Self {
            http,
            base_url: config.geocoder_base_url.trim_end_matches('/').to_string(),
            api_key: config.geocoder_api_key.clone(),
        }
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocodeClient {
    async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<GeocodeMatch>> {
        let mut request = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "jsonv2")])
            .query(&[("limit", limit.to_string())]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        let rows: Vec<SearchRow> = request.send().await?.error_for_status()?.json().await?;
        Ok(matches_from_rows(rows))
    }

    async fn reverse(&self, coordinate: Coordinate) -> AppResult<Option<String>> {
        let mut request = self
            .http
            .get(format!("{}/reverse", self.base_url))
            .query(&[
                ("lat", coordinate.latitude.to_string()),
                ("lon", coordinate.longitude.to_string()),
            ])
            .query(&[("format", "jsonv2")]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        let payload: ReverseRow = request.send().await?.error_for_status()?.json().await?;
        Ok(normalize_display_name(payload.display_name))
    }
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    lat: String,
    lon: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ReverseRow {
    display_name: Option<String>,
}

// The wire format ships coordinates as strings; candidates that fail to
// parse are dropped rather than failing the whole response.
fn matches_from_rows(rows: Vec<SearchRow>) -> Vec<GeocodeMatch> {
    rows.into_iter()
        .filter_map(|row| match Coordinate::parse(&row.lat, &row.lon) {
            Ok(coordinate) => Some(GeocodeMatch {
                display_name: row.display_name,
                coordinate,
            }),
            Err(err) => {
                warn!(?err, name = %row.display_name, "skipping geocode candidate");
                None
            }
        })
        .collect()
}

fn normalize_display_name(name: Option<String>) -> Option<String> {
    name.map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct StaticLookup {
        matches: Vec<GeocodeMatch>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GeocodeLookup for StaticLookup {
        async fn search(&self, _query: &str, limit: usize) -> AppResult<Vec<GeocodeMatch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.matches.iter().take(limit).cloned().collect())
        }

        async fn reverse(&self, _coordinate: Coordinate) -> AppResult<Option<String>> {
            Ok(Some("Somewhere".into()))
        }
    }

    fn sample_match(name: &str, latitude: f64, longitude: f64) -> GeocodeMatch {
        GeocodeMatch {
            display_name: name.to_string(),
            coordinate: Coordinate::new(latitude, longitude).unwrap(),
        }
    }

    #[test]
    fn drops_candidates_with_malformed_coordinates() {
        let rows = vec![
            SearchRow {
                lat: "37.7749".into(),
                lon: "-122.4194".into(),
                display_name: "San Francisco".into(),
            },
            SearchRow {
                lat: "not-a-number".into(),
                lon: "10".into(),
                display_name: "Broken".into(),
            },
            SearchRow {
                lat: "95.0".into(),
                lon: "10".into(),
                display_name: "Off the globe".into(),
            },
        ];

        let matches = matches_from_rows(rows);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].display_name, "San Francisco");
        assert_eq!(matches[0].coordinate.latitude, 37.7749);
    }

    #[test]
    fn blank_display_names_collapse_to_none() {
        assert_eq!(normalize_display_name(None), None);
        assert_eq!(normalize_display_name(Some("   ".into())), None);
        assert_eq!(
            normalize_display_name(Some("  Farmville  ".into())),
            Some("Farmville".to_string())
        );
    }

    #[tokio::test]
    async fn service_delegates_and_preserves_candidate_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = StaticLookup {
            matches: vec![
                sample_match("First", 1.0, 2.0),
                sample_match("Second", 3.0, 4.0),
                sample_match("Third", 5.0, 6.0),
            ],
            calls: Arc::clone(&calls),
        };
        let service = GeocodeService::from_lookup(Arc::new(lookup), 50);

        let matches = service.search("farm", 2).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].display_name, "First");
        assert_eq!(matches[1].display_name, "Second");

        let name = service
            .reverse(Coordinate::new(1.0, 2.0).unwrap())
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("Somewhere"));
    }
}
