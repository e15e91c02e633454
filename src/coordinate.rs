use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Validated WGS84 point. Construction goes through `new`/`parse`, so
/// downstream stages never see NaN or out-of-range values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> AppResult<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(AppError::InvalidCoordinate(
                "coordinates must be finite numbers".into(),
            ));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(AppError::InvalidCoordinate(format!(
                "latitude {latitude} is outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(AppError::InvalidCoordinate(format!(
                "longitude {longitude} is outside [-180, 180]"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn parse(latitude_text: &str, longitude_text: &str) -> AppResult<Self> {
        let latitude = parse_axis(latitude_text, "latitude")?;
        let longitude = parse_axis(longitude_text, "longitude")?;
        Self::new(latitude, longitude)
    }

    /// Key with both axes rounded to three decimals (roughly 110 m), so
    /// nearby re-lookups share a cache entry.
    pub fn cache_key(&self) -> String {
        format!("{:.3}_{:.3}", self.latitude, self.longitude)
    }
}

fn parse_axis(text: &str, axis: &str) -> AppResult<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidCoordinate(format!("{axis} is required")));
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| AppError::InvalidCoordinate(format!("{axis} must be a number, got {trimmed:?}")))
}
