use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;

const CONFIDENCE_FLOOR: f64 = 0.4;
const CONFIDENCE_CEIL: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreFactor {
    pub label: &'static str,
    pub value: i64,
    pub sign: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub score: u8,
    pub confidence: f64,
    pub factors: Vec<ScoreFactor>,
    pub month: u32,
    pub trend: Vec<f64>,
}

/// Computes the crop success score for a spot. Pure and deterministic: no
/// I/O, no failure mode. A missing or unparsable date falls back to the
/// current UTC month and forfeits the date confidence bonus. Callers hand in
/// validated coordinates; the engine itself never rejects input.
pub fn evaluate(
    latitude: f64,
    longitude: f64,
    date: Option<&str>,
    crop: &str,
    soil: &str,
) -> ScoreResult {
    let (month, date_known) = resolve_month(date);
    let base = 50.0 + 15.0 * (latitude * PI / 180.0).cos() + 10.0 * (longitude * PI / 180.0).sin();
    let season = season_adjustment(month);
    let soil_adj = soil_adjustment(soil, crop);
    let rain = rain_proxy(latitude);
    let (clamped, clamp_adj) = clamp_with_adjustment(base + season + soil_adj + rain);

    let trend = (1..=12)
        .map(|m| clamp_with_adjustment(base + season_adjustment(m) + soil_adj + rain).0)
        .collect();

    ScoreResult {
        score: clamped.round() as u8,
        confidence: confidence(soil, crop, date_known, latitude, longitude),
        factors: vec![
            factor("Coordinate baseline", base),
            factor("Seasonality", season),
            factor("Soil compatibility", soil_adj),
            factor("Rainfall proxy", rain),
            clamp_factor(clamp_adj),
        ],
        month,
        trend,
    }
}

fn resolve_month(date: Option<&str>) -> (u32, bool) {
    let Some(text) = date.map(str::trim).filter(|text| !text.is_empty()) else {
        return (Utc::now().month(), false);
    };
    match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        Ok(parsed) => (parsed.month(), true),
        Err(_) => (Utc::now().month(), false),
    }
}

fn season_adjustment(month: u32) -> f64 {
    match month {
        3..=5 => 6.0,
        6..=8 => 2.0,
        9..=11 => 4.0,
        _ => -3.0,
    }
}

// Soil is matched on "sand" rather than "sandy" so the bare "Sand" texture
// label takes the same branch. Clay wins over loam for "Clay Loam".
fn soil_adjustment(soil: &str, crop: &str) -> f64 {
    let soil = soil.to_lowercase();
    let crop = crop.to_lowercase();
    if soil.contains("clay") {
        if crop.contains("rice") {
            8.0
        } else if crop.contains("carrot") || crop.contains("potato") {
            -4.0
        } else {
            0.0
        }
    } else if soil.contains("sand") {
        if crop.contains("peanut") || crop.contains("cotton") {
            6.0
        } else if crop.contains("rice") {
            -6.0
        } else {
            0.0
        }
    } else if soil.contains("loam") {
        5.0
    } else {
        0.0
    }
}

fn rain_proxy(latitude: f64) -> f64 {
    if latitude.abs() < 15.0 {
        4.0
    } else {
        0.0
    }
}

fn clamp_with_adjustment(raw: f64) -> (f64, f64) {
    let clamped = raw.clamp(0.0, 100.0);
    (clamped, clamped - raw)
}

fn confidence(soil: &str, crop: &str, date_known: bool, latitude: f64, longitude: f64) -> f64 {
    let mut value: f64 = 0.5;
    if !soil.trim().is_empty() {
        value += 0.15;
    }
    if !crop.trim().is_empty() {
        value += 0.15;
    }
    if date_known {
        value += 0.1;
    }
    if latitude.is_finite() && longitude.is_finite() {
        value += 0.1;
    }
    value.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL)
}

fn factor(label: &'static str, value: f64) -> ScoreFactor {
    let rounded = value.round() as i64;
    ScoreFactor {
        label,
        value: rounded,
        sign: sign_for(rounded),
    }
}

fn clamp_factor(adjustment: f64) -> ScoreFactor {
    let rounded = adjustment.round() as i64;
    ScoreFactor {
        label: "Clamp adjustment",
        value: rounded,
        sign: if rounded != 0 { "±" } else { "" },
    }
}

fn sign_for(value: i64) -> &'static str {
    if value > 0 {
        "+"
    } else if value < 0 {
        "-"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn san_francisco_rice_on_clay_in_april() {
        let result = evaluate(37.7749, -122.4194, Some("2024-04-10"), "Rice", "Clay");

        assert_eq!(result.score, 67);
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.month, 4);

        assert_eq!(result.factors.len(), 5);
        assert_eq!(result.factors[0].label, "Coordinate baseline");
        assert_eq!(result.factors[0].value, 53);
        assert_eq!(result.factors[0].sign, "+");
        assert_eq!(result.factors[1].value, 6);
        assert_eq!(result.factors[1].sign, "+");
        assert_eq!(result.factors[2].value, 8);
        assert_eq!(result.factors[2].sign, "+");
        assert_eq!(result.factors[3].value, 0);
        assert_eq!(result.factors[3].sign, "");
        assert_eq!(result.factors[4].label, "Clamp adjustment");
        assert_eq!(result.factors[4].value, 0);
        assert_eq!(result.factors[4].sign, "");

        assert_eq!(result.trend.len(), 12);
        // April's trend entry carries the unrounded raw score.
        assert!((result.trend[3] - 67.416).abs() < 0.01);
        // January swaps the +6 spring bump for the -3 winter dip.
        assert!((result.trend[3] - result.trend[0] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn identical_inputs_produce_identical_results() {
        let a = evaluate(-23.55, -46.63, Some("2025-11-01"), "Soybean", "Loam");
        let b = evaluate(-23.55, -46.63, Some("2025-11-01"), "Soybean", "Loam");
        assert_eq!(a, b);
    }

    #[test]
    fn score_confidence_and_trend_stay_in_bounds() {
        let latitudes = [-90.0, -45.0, -14.9, 0.0, 37.7749, 90.0];
        let longitudes = [-180.0, -90.0, 0.0, 90.0, 180.0];
        let dates = [None, Some("2024-01-15"), Some("2024-07-15")];
        let soils = ["", "Clay", "Sand", "Silt Loam"];
        let crops = ["", "Rice", "Peanut"];
        for lat in latitudes {
            for lon in longitudes {
                for date in dates {
                    for soil in soils {
                        for crop in crops {
                            let result = evaluate(lat, lon, date, crop, soil);
                            assert!(result.score <= 100);
                            assert!(result.confidence >= CONFIDENCE_FLOOR);
                            assert!(result.confidence <= CONFIDENCE_CEIL);
                            assert_eq!(result.trend.len(), 12);
                            for entry in &result.trend {
                                assert!((0.0..=100.0).contains(entry));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn clamp_records_the_removed_amount() {
        let (clamped, adjustment) = clamp_with_adjustment(132.25);
        assert_eq!(clamped, 100.0);
        assert!((adjustment + 32.25).abs() < 1e-9);

        let (clamped, adjustment) = clamp_with_adjustment(-5.0);
        assert_eq!(clamped, 0.0);
        assert_eq!(adjustment, 5.0);

        let (clamped, adjustment) = clamp_with_adjustment(67.4);
        assert_eq!(clamped, 67.4);
        assert_eq!(adjustment, 0.0);

        let factor = clamp_factor(-32.25);
        assert_eq!(factor.value, -32);
        assert_eq!(factor.sign, "±");
    }

    #[test]
    fn soil_adjustment_follows_the_crop_pairing_rules() {
        assert_eq!(soil_adjustment("Clay", "Rice"), 8.0);
        assert_eq!(soil_adjustment("Clay Loam", "Potato"), -4.0);
        assert_eq!(soil_adjustment("clay", "Carrot"), -4.0);
        assert_eq!(soil_adjustment("Clay", "Tomato"), 0.0);
        assert_eq!(soil_adjustment("Sand", "Rice"), -6.0);
        assert_eq!(soil_adjustment("Sandy Loam", "Peanut"), 6.0);
        assert_eq!(soil_adjustment("Sand", "COTTON"), 6.0);
        assert_eq!(soil_adjustment("Silt Loam", "Wheat"), 5.0);
        assert_eq!(soil_adjustment("Loam", "Rice"), 5.0);
        assert_eq!(soil_adjustment("", "Rice"), 0.0);
        assert_eq!(soil_adjustment("Chalk", "Rice"), 0.0);
    }

    #[test]
    fn season_buckets_cover_the_year() {
        assert_eq!(season_adjustment(3), 6.0);
        assert_eq!(season_adjustment(5), 6.0);
        assert_eq!(season_adjustment(6), 2.0);
        assert_eq!(season_adjustment(8), 2.0);
        assert_eq!(season_adjustment(9), 4.0);
        assert_eq!(season_adjustment(11), 4.0);
        assert_eq!(season_adjustment(12), -3.0);
        assert_eq!(season_adjustment(1), -3.0);
    }

    #[test]
    fn rainfall_proxy_applies_strictly_inside_the_tropics_band() {
        let tropical = evaluate(10.0, 20.0, Some("2024-06-01"), "", "");
        assert_eq!(tropical.factors[3].value, 4);
        assert_eq!(tropical.factors[3].sign, "+");

        let boundary = evaluate(15.0, 20.0, Some("2024-06-01"), "", "");
        assert_eq!(boundary.factors[3].value, 0);
        assert_eq!(boundary.factors[3].sign, "");
    }

    #[test]
    fn unparsable_date_counts_as_unknown() {
        let missing = evaluate(37.0, -122.0, None, "Rice", "Clay");
        let garbled = evaluate(37.0, -122.0, Some("04/10/2024"), "Rice", "Clay");
        let parsed = evaluate(37.0, -122.0, Some("2024-04-10"), "Rice", "Clay");

        assert!((missing.confidence - garbled.confidence).abs() < 1e-9);
        assert!(parsed.confidence > garbled.confidence);
        assert!((1..=12).contains(&garbled.month));
    }

    #[test]
    fn trend_is_constant_within_a_season_bucket() {
        let result = evaluate(48.85, 2.35, Some("2024-02-01"), "Wheat", "Loam");
        assert_eq!(result.trend[2], result.trend[3]);
        assert_eq!(result.trend[3], result.trend[4]);
        assert_eq!(result.trend[11], result.trend[0]);
        assert!((result.trend[5] - result.trend[0] - 5.0).abs() < 1e-9);
    }
}
