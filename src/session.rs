use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::coordinate::Coordinate;
use crate::crops;
use crate::debounce::{CancelSignal, Debouncer};
use crate::errors::AppResult;
use crate::geocode::{GeocodeMatch, GeocodeService};
use crate::score::{self, ScoreResult};
use crate::soil::{AttemptStage, SoilClassifier, SoilOutcome, SoilService, SoilSource};
use crate::telemetry::TelemetryClient;

const CROP_SUGGESTION_LIMIT: usize = 8;
const MIN_AREA_QUERY_CHARS: usize = 2;
const MIN_PLACE_QUERY_CHARS: usize = 3;

/// Mutually exclusive presentation states for the soil and score panels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PanelState<T> {
    Idle,
    Loading,
    Failed { message: String },
    Ready { value: T },
}

impl<T> PanelState<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            PanelState::Ready { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, PanelState::Loading)
    }
}

impl<T> Default for PanelState<T> {
    fn default() -> Self {
        PanelState::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoilReading {
    pub label: String,
    pub via: SoilSource,
}

/// Read-only copy of the dashboard state handed to the view layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub area_query: String,
    pub place_query: String,
    pub latitude_input: String,
    pub longitude_input: String,
    pub date_input: String,
    pub crop: String,
    pub coordinate: Option<Coordinate>,
    pub display_name: Option<String>,
    pub area_suggestions: Vec<GeocodeMatch>,
    pub crop_suggestions: Vec<&'static str>,
    pub geocode_error: Option<String>,
    pub soil: PanelState<SoilReading>,
    pub score: PanelState<ScoreResult>,
}

#[derive(Default)]
struct SessionState {
    area_query: String,
    place_query: String,
    latitude_input: String,
    longitude_input: String,
    date_input: String,
    crop: String,
    coordinate: Option<Coordinate>,
    display_name: Option<String>,
    area_suggestions: Vec<GeocodeMatch>,
    crop_suggestions: Vec<&'static str>,
    geocode_error: Option<String>,
    soil: PanelState<SoilReading>,
    score: PanelState<ScoreResult>,
    analyzed: bool,
}

impl SessionState {
    fn soil_label(&self) -> &str {
        match &self.soil {
            PanelState::Ready { value } => &value.label,
            _ => "",
        }
    }

    fn date_argument(&self) -> Option<&str> {
        let trimmed = self.date_input.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    // Live recompute. Runs only once a dashboard session is active and the
    // coordinate fields parse; mid-edit input skips silently.
    fn recompute(&mut self) {
        if !self.analyzed {
            return;
        }
        let Some(coordinate) = self.coordinate else {
            return;
        };
        let result = score::evaluate(
            coordinate.latitude,
            coordinate.longitude,
            self.date_argument(),
            &self.crop,
            self.soil_label(),
        );
        debug!(score = result.score, "score recomputed");
        self.score = PanelState::Ready { value: result };
    }
}

/// Owns the dashboard state and keeps the published score and soil panels
/// consistent with the latest confirmed inputs. Each input stream gets its
/// own debouncer; soil publishes are guarded by an epoch counter so a
/// superseded attempt can never overwrite newer state.
pub struct DashboardSession {
    geocoder: GeocodeService,
    soil: SoilClassifier,
    telemetry: TelemetryClient,
    state: Arc<Mutex<SessionState>>,
    area_debounce: Debouncer,
    place_debounce: Debouncer,
    crop_debounce: Debouncer,
    soil_epoch: Arc<AtomicU64>,
    area_suggestion_limit: usize,
}

impl DashboardSession {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        crate::init_tracing();
        let telemetry = TelemetryClient::new(data_dir, config)?;
        if let Err(err) = telemetry.record(
            "session_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "telemetry_enabled": config.telemetry_enabled,
            }),
        ) {
            warn!(?err, "failed to queue session start event");
        }
        if let Err(err) = telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }
        let geocoder = GeocodeService::new(config);
        let soil = SoilClassifier::new(SoilService::new(config), config.soil_cache_ttl_secs);
        Ok(Self::assemble(config, geocoder, soil, telemetry))
    }

    #[cfg(test)]
    fn with_services(
        config: &AppConfig,
        geocoder: GeocodeService,
        soil: SoilClassifier,
        telemetry: TelemetryClient,
    ) -> Self {
        Self::assemble(config, geocoder, soil, telemetry)
    }

    fn assemble(
        config: &AppConfig,
        geocoder: GeocodeService,
        soil: SoilClassifier,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            geocoder,
            soil,
            telemetry,
            state: Arc::new(Mutex::new(SessionState::default())),
            area_debounce: Debouncer::new(Duration::from_millis(config.suggestion_debounce_ms)),
            place_debounce: Debouncer::new(Duration::from_millis(config.geocode_debounce_ms)),
            crop_debounce: Debouncer::new(Duration::from_millis(config.suggestion_debounce_ms)),
            soil_epoch: Arc::new(AtomicU64::new(0)),
            area_suggestion_limit: config.area_suggestion_limit,
        }
    }

    /// Area autocomplete. Queries shorter than two characters clear the
    /// suggestion list without touching the network.
    pub fn on_area_query_change(&self, text: &str) {
        let query = text.trim().to_string();
        {
            let mut state = self.state.lock();
            state.area_query = text.to_string();
            if query.chars().count() < MIN_AREA_QUERY_CHARS {
                state.area_suggestions.clear();
                drop(state);
                self.area_debounce.cancel();
                return;
            }
        }

        let geocoder = self.geocoder.clone();
        let state = Arc::clone(&self.state);
        let limit = self.area_suggestion_limit;
        self.area_debounce.trigger(move |signal| async move {
            match geocoder.search(&query, limit).await {
                Ok(matches) => {
                    if signal.is_cancelled() {
                        return;
                    }
                    let mut state = state.lock();
                    state.area_suggestions = matches;
                    state.geocode_error = None;
                }
                Err(err) => {
                    warn!(?err, "area suggestion lookup failed");
                    if signal.is_cancelled() {
                        return;
                    }
                    state.lock().geocode_error = Some("location search failed".into());
                }
            }
        });
    }

    /// Place-name stream: a typing pause of the configured window confirms
    /// the current query. Queries shorter than three characters stand the
    /// stream down.
    pub fn on_place_query_change(&self, text: &str) {
        let query = text.trim().to_string();
        self.state.lock().place_query = text.to_string();
        if query.chars().count() < MIN_PLACE_QUERY_CHARS {
            self.place_debounce.cancel();
            return;
        }
        self.schedule_confirm(query, false);
    }

    /// Explicit confirmation (enter key or button): the same lookup as the
    /// debounced stream, run immediately and superseding it.
    pub fn on_place_confirm(&self) {
        let query = self.state.lock().place_query.trim().to_string();
        if query.chars().count() < MIN_PLACE_QUERY_CHARS {
            return;
        }
        self.schedule_confirm(query, true);
    }

    fn schedule_confirm(&self, query: String, immediate: bool) {
        let geocoder = self.geocoder.clone();
        let state = Arc::clone(&self.state);
        let telemetry = self.telemetry.clone();
        let soil_epoch = Arc::clone(&self.soil_epoch);
        let lookup = move |signal: CancelSignal| {
            confirm_place(geocoder, state, telemetry, soil_epoch, query, signal)
        };
        if immediate {
            self.place_debounce.trigger_now(lookup);
        } else {
            self.place_debounce.trigger(lookup);
        }
    }

    /// Crop field typing: the score recomputes immediately (the engine is
    /// pure) and catalog suggestions refresh after the quiet period.
    pub fn on_crop_query_change(&self, text: &str) {
        {
            let mut state = self.state.lock();
            state.crop = text.to_string();
            state.recompute();
            if text.trim().is_empty() {
                state.crop_suggestions.clear();
                drop(state);
                self.crop_debounce.cancel();
                return;
            }
        }

        let query = text.to_string();
        let state = Arc::clone(&self.state);
        self.crop_debounce.trigger(move |signal| async move {
            let matches = crops::suggestions(&query, CROP_SUGGESTION_LIMIT);
            if signal.is_cancelled() {
                return;
            }
            state.lock().crop_suggestions = matches;
        });
    }

    /// Picks a crop outright (suggestion click), clearing the dropdown.
    pub fn set_crop(&self, crop: &str) {
        self.crop_debounce.cancel();
        let mut state = self.state.lock();
        state.crop = crop.to_string();
        state.crop_suggestions.clear();
        state.recompute();
    }

    pub fn set_latitude_input(&self, text: &str) {
        let mut state = self.state.lock();
        state.latitude_input = text.to_string();
        self.refresh_coordinate(&mut state);
    }

    pub fn set_longitude_input(&self, text: &str) {
        let mut state = self.state.lock();
        state.longitude_input = text.to_string();
        self.refresh_coordinate(&mut state);
    }

    /// Direct coordinate hand-off (map click or picked area suggestion).
    pub fn set_coordinate(&self, coordinate: Coordinate) {
        let mut state = self.state.lock();
        state.latitude_input = coordinate.latitude.to_string();
        state.longitude_input = coordinate.longitude.to_string();
        state.coordinate = Some(coordinate);
        self.soil_epoch.fetch_add(1, Ordering::SeqCst);
        state.recompute();
    }

    pub fn set_date_input(&self, text: &str) {
        let mut state = self.state.lock();
        state.date_input = text.to_string();
        state.recompute();
    }

    // Re-parses the coordinate fields after an edit. While either field is
    // mid-edit the working coordinate is cleared and recompute skips
    // silently; soil work in flight for the old spot is superseded either way.
    fn refresh_coordinate(&self, state: &mut SessionState) {
        self.soil_epoch.fetch_add(1, Ordering::SeqCst);
        match Coordinate::parse(&state.latitude_input, &state.longitude_input) {
            Ok(coordinate) => {
                state.coordinate = Some(coordinate);
                state.recompute();
            }
            Err(err) => {
                debug!(%err, "coordinate fields incomplete; holding recompute");
                state.coordinate = None;
            }
        }
    }

    /// Full analysis pass: validates the coordinate, publishes an optimistic
    /// score right away, then classifies soil and enriches the display name
    /// concurrently. The epoch taken here guards every later publish.
    pub fn analyze(&self) {
        let (coordinate, signal) = {
            let mut state = self.state.lock();
            let coordinate =
                match Coordinate::parse(&state.latitude_input, &state.longitude_input) {
                    Ok(coordinate) => coordinate,
                    Err(err) => {
                        state.score = PanelState::Failed {
                            message: err.to_string(),
                        };
                        return;
                    }
                };
            state.coordinate = Some(coordinate);
            state.analyzed = true;
            // A fresh attempt owns the soil panel; whatever was shown before
            // is cleared along with any stale in-flight publish.
            self.soil_epoch.fetch_add(1, Ordering::SeqCst);
            state.soil = PanelState::Loading;
            state.recompute();
            (coordinate, CancelSignal::subscribe(&self.soil_epoch))
        };

        if let Err(err) = self.telemetry.record(
            "analyze",
            json!({
                "latitude": coordinate.latitude,
                "longitude": coordinate.longitude,
            }),
        ) {
            warn!(?err, "failed to record analyze event");
        }

        let soil = self.soil.clone();
        let geocoder = self.geocoder.clone();
        let state = Arc::clone(&self.state);
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            let stage_telemetry = telemetry.clone();
            let observer: Arc<dyn Fn(AttemptStage) + Send + Sync> = Arc::new(move |stage| {
                if let Err(err) =
                    stage_telemetry.record("soil_stage", json!({ "stage": stage.as_tag() }))
                {
                    warn!(?err, "failed to record soil stage event");
                }
            });

            let (outcome, reverse) = join(
                soil.resolve(coordinate, &signal, Some(observer)),
                geocoder.reverse(coordinate),
            )
            .await;

            if signal.is_cancelled() {
                return;
            }
            let mut state = state.lock();
            match reverse {
                Ok(Some(name)) => state.display_name = Some(name),
                Ok(None) => {}
                Err(err) => warn!(?err, "reverse geocoding failed"),
            }
            match outcome {
                SoilOutcome::Resolved { label, via } => {
                    state.soil = PanelState::Ready {
                        value: SoilReading { label, via },
                    };
                    state.recompute();
                }
                SoilOutcome::Failed { message } => {
                    state.soil = PanelState::Failed {
                        message: message.clone(),
                    };
                    drop(state);
                    if let Err(err) = telemetry.record("soil_failed", json!({ "message": message }))
                    {
                        warn!(?err, "failed to record soil failure event");
                    }
                }
                SoilOutcome::Cancelled => {}
            }
        });
    }

    /// Read-only copy of the current dashboard state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            area_query: state.area_query.clone(),
            place_query: state.place_query.clone(),
            latitude_input: state.latitude_input.clone(),
            longitude_input: state.longitude_input.clone(),
            date_input: state.date_input.clone(),
            crop: state.crop.clone(),
            coordinate: state.coordinate,
            display_name: state.display_name.clone(),
            area_suggestions: state.area_suggestions.clone(),
            crop_suggestions: state.crop_suggestions.clone(),
            geocode_error: state.geocode_error.clone(),
            soil: state.soil.clone(),
            score: state.score.clone(),
        }
    }

    /// Flushes queued telemetry events to disk.
    pub fn flush_telemetry(&self) -> AppResult<()> {
        self.telemetry.flush()
    }
}

async fn confirm_place(
    geocoder: GeocodeService,
    state: Arc<Mutex<SessionState>>,
    telemetry: TelemetryClient,
    soil_epoch: Arc<AtomicU64>,
    query: String,
    signal: CancelSignal,
) {
    match geocoder.search(&query, 1).await {
        Ok(matches) => {
            if signal.is_cancelled() {
                return;
            }
            let Some(hit) = matches.into_iter().next() else {
                state.lock().geocode_error = Some(format!("no match found for {query:?}"));
                return;
            };
            {
                let mut state = state.lock();
                // A confirmed coordinate supersedes any classification still
                // in flight for the previous spot.
                soil_epoch.fetch_add(1, Ordering::SeqCst);
                state.coordinate = Some(hit.coordinate);
                state.latitude_input = hit.coordinate.latitude.to_string();
                state.longitude_input = hit.coordinate.longitude.to_string();
                state.display_name = Some(hit.display_name.clone());
                state.geocode_error = None;
                state.recompute();
            }
            if let Err(err) = telemetry.record(
                "place_confirmed",
                json!({
                    "query": query,
                    "display_name": hit.display_name,
                }),
            ) {
                warn!(?err, "failed to record place confirmation");
            }
        }
        Err(err) => {
            warn!(?err, "place geocoding failed");
            if signal.is_cancelled() {
                return;
            }
            state.lock().geocode_error = Some("location search failed".into());
        }
    }
}
