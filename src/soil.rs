use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::coordinate::Coordinate;
use crate::debounce::CancelSignal;
use crate::errors::{AppError, AppResult};

/// Texture classes the composition fallback can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SoilTexture {
    Clay,
    ClayLoam,
    Sand,
    SandyLoam,
    SiltLoam,
    Loam,
}

impl SoilTexture {
    /// Derives a texture from topsoil sand/clay percentages. Rows are
    /// evaluated top down and the first match wins; sand is checked before
    /// sandy loam so coarse samples keep the narrower label.
    pub fn from_composition(sand_percent: f64, clay_percent: f64) -> Self {
        if clay_percent >= 40.0 {
            SoilTexture::Clay
        } else if clay_percent >= 27.0 && sand_percent <= 45.0 {
            SoilTexture::ClayLoam
        } else if sand_percent >= 80.0 && clay_percent < 10.0 {
            SoilTexture::Sand
        } else if sand_percent >= 70.0 && clay_percent <= 15.0 {
            SoilTexture::SandyLoam
        } else if clay_percent <= 10.0 && sand_percent <= 52.0 {
            SoilTexture::SiltLoam
        } else {
            SoilTexture::Loam
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SoilTexture::Clay => "Clay",
            SoilTexture::ClayLoam => "Clay Loam",
            SoilTexture::Sand => "Sand",
            SoilTexture::SandyLoam => "Sandy Loam",
            SoilTexture::SiltLoam => "Silt Loam",
            SoilTexture::Loam => "Loam",
        }
    }
}

/// Topsoil sand/clay shares, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoilComposition {
    pub sand_percent: f64,
    pub clay_percent: f64,
}

/// Where a classification attempt currently stands. Attempts step
/// Idle -> Primary, fall back to composition on an empty or failed primary,
/// and finish in Resolved or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    Idle,
    Primary,
    Fallback,
    Resolved,
    Failed,
}

impl AttemptStage {
    pub fn as_tag(&self) -> &'static str {
        match self {
            AttemptStage::Idle => "idle",
            AttemptStage::Primary => "primary",
            AttemptStage::Fallback => "fallback",
            AttemptStage::Resolved => "resolved",
            AttemptStage::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoilSource {
    Cache,
    Classification,
    Composition,
}

impl SoilSource {
    pub fn as_tag(&self) -> &'static str {
        match self {
            SoilSource::Cache => "cache",
            SoilSource::Classification => "classification",
            SoilSource::Composition => "composition",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SoilOutcome {
    Resolved { label: String, via: SoilSource },
    Failed { message: String },
    Cancelled,
}

struct CacheEntry {
    label: String,
    stored_at: DateTime<Utc>,
}

/// Runs the primary-then-fallback classification attempt and remembers
/// resolved labels per rounded coordinate so re-analyzing the same spot
/// skips the network.
#[derive(Clone)]
pub struct SoilClassifier {
    service: SoilService,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl_secs: i64,
}

impl SoilClassifier {
    pub fn new(service: SoilService, ttl_secs: u64) -> Self {
        Self {
            service,
            cache: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs: ttl_secs as i64,
        }
    }

    /// Resolves the soil type for a spot. Cancellation is silent: a tripped
    /// signal yields `Cancelled`, never an error. The observer sees each
    /// stage the attempt passes through.
    pub async fn resolve(
        &self,
        coordinate: Coordinate,
        signal: &CancelSignal,
        observer: Option<Arc<dyn Fn(AttemptStage) + Send + Sync>>,
    ) -> SoilOutcome {
        let notify = |stage: AttemptStage| {
            if let Some(callback) = &observer {
                callback(stage);
            }
        };

        if signal.is_cancelled() {
            return SoilOutcome::Cancelled;
        }
        notify(AttemptStage::Idle);

        if let Some(label) = self.cached(&coordinate) {
            debug!(%label, "soil type served from cache");
            notify(AttemptStage::Resolved);
            return SoilOutcome::Resolved {
                label,
                via: SoilSource::Cache,
            };
        }

        notify(AttemptStage::Primary);
        match self.service.classify(coordinate).await {
            Ok(Some(label)) if !label.trim().is_empty() => {
                let label = label.trim().to_string();
                self.store(&coordinate, &label);
                if signal.is_cancelled() {
                    return SoilOutcome::Cancelled;
                }
                notify(AttemptStage::Resolved);
                return SoilOutcome::Resolved {
                    label,
                    via: SoilSource::Classification,
                };
            }
            Ok(_) => debug!("classification returned no usable class; deriving from composition"),
            Err(err) => warn!(?err, "soil classification failed; deriving from composition"),
        }

        if signal.is_cancelled() {
            return SoilOutcome::Cancelled;
        }
        notify(AttemptStage::Fallback);
        match self.service.composition(coordinate).await {
            Ok(sample) => {
                let label = SoilTexture::from_composition(sample.sand_percent, sample.clay_percent)
                    .display_name()
                    .to_string();
                self.store(&coordinate, &label);
                if signal.is_cancelled() {
                    return SoilOutcome::Cancelled;
                }
                notify(AttemptStage::Resolved);
                SoilOutcome::Resolved {
                    label,
                    via: SoilSource::Composition,
                }
            }
            Err(err) => {
                warn!(?err, "soil composition fallback failed");
                if signal.is_cancelled() {
                    return SoilOutcome::Cancelled;
                }
                notify(AttemptStage::Failed);
                SoilOutcome::Failed {
                    message: "soil type unavailable".into(),
                }
            }
        }
    }

    fn cached(&self, coordinate: &Coordinate) -> Option<String> {
        let mut cache = self.cache.lock();
        let key = coordinate.cache_key();
        match cache.get(&key) {
            Some(entry)
                if Utc::now().signed_duration_since(entry.stored_at).num_seconds()
                    < self.ttl_secs =>
            {
                Some(entry.label.clone())
            }
            Some(_) => {
                cache.remove(&key);
                None
            }
            None => None,
        }
    }

    fn store(&self, coordinate: &Coordinate, label: &str) {
        self.cache.lock().insert(
            coordinate.cache_key(),
            CacheEntry {
                label: label.to_string(),
                stored_at: Utc::now(),
            },
        );
    }
}

#[derive(Clone)]
pub struct SoilService {
    inner: Arc<dyn SoilLookup>,
}

impl SoilService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(HttpSoilClient::new(config)),
        }
    }

    #[cfg(test)]
    pub fn from_lookup(lookup: Arc<dyn SoilLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn classify(&self, coordinate: Coordinate) -> AppResult<Option<String>> {
        self.inner.classify(coordinate).await
    }

    pub async fn composition(&self, coordinate: Coordinate) -> AppResult<SoilComposition> {
        self.inner.composition(coordinate).await
    }
}

#[async_trait]
pub trait SoilLookup: Send + Sync {
    /// The service's own class name for the spot, when it has one.
    async fn classify(&self, coordinate: Coordinate) -> AppResult<Option<String>>;
    /// Topsoil sand/clay percentages for the decision-table fallback.
    async fn composition(&self, coordinate: Coordinate) -> AppResult<SoilComposition>;
}

struct HttpSoilClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSoilClient {
    fn new(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(config.http_user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("soil http client");
        Self {
            http,
            base_url: config.soil_api_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SoilLookup for HttpSoilClient {
    async fn classify(&self, coordinate: Coordinate) -> AppResult<Option<String>> {
        #[derive(serde::Deserialize)]
        struct Response {
            wrb_class_name: Option<String>,
        }

        let response: Response = self
            .http
            .get(format!("{}/classification/query", self.base_url))
            .query(&[
                ("lon", coordinate.longitude.to_string()),
                ("lat", coordinate.latitude.to_string()),
            ])
            .query(&[("number_classes", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.wrb_class_name)
    }

    async fn composition(&self, coordinate: Coordinate) -> AppResult<SoilComposition> {
        #[derive(serde::Deserialize)]
        struct Response {
            properties: Option<Layers>,
        }

        #[derive(serde::Deserialize)]
        struct Layers {
            layers: Vec<Layer>,
        }

        #[derive(serde::Deserialize)]
        struct Layer {
            name: String,
            depths: Vec<Depth>,
        }

        #[derive(serde::Deserialize)]
        struct Depth {
            values: Values,
        }

        #[derive(serde::Deserialize)]
        struct Values {
            mean: Option<f64>,
        }

        let response: Response = self
            .http
            .get(format!("{}/properties/query", self.base_url))
            .query(&[
                ("lon", coordinate.longitude.to_string()),
                ("lat", coordinate.latitude.to_string()),
            ])
            .query(&[
                ("property", "sand"),
                ("property", "clay"),
                ("depth", "0-5cm"),
                ("value", "mean"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut sand = None;
        let mut clay = None;
        for layer in response.properties.map(|p| p.layers).unwrap_or_default() {
            let mean = layer.depths.first().and_then(|depth| depth.values.mean);
            match layer.name.as_str() {
                "sand" => sand = mean,
                "clay" => clay = mean,
                _ => {}
            }
        }

        // Means arrive in g/kg; the decision table wants percent.
        match (sand, clay) {
            (Some(sand), Some(clay)) => Ok(SoilComposition {
                sand_percent: sand / 10.0,
                clay_percent: clay / 10.0,
            }),
            _ => Err(AppError::Upstream(
                "soil property response missing sand or clay mean".into(),
            )),
        }
    }
}
