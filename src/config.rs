use std::{env, io};

use secrecy::SecretString;
use tracing::debug;

const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_SOIL_API_BASE_URL: &str = "https://rest.isric.org/soilgrids/v2.0";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_base_url: String,
    pub soil_api_base_url: String,
    pub http_user_agent: String,
    pub request_timeout_secs: u64,
    pub suggestion_debounce_ms: u64,
    pub geocode_debounce_ms: u64,
    pub area_suggestion_limit: usize,
    pub geocoder_rate_limit_qps: u32,
    pub soil_cache_ttl_secs: u64,
    pub geocoder_api_key: Option<SecretString>,
    pub telemetry_enabled: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_BASE_URL.to_string()),
            soil_api_base_url: env::var("SOIL_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SOIL_API_BASE_URL.to_string()),
            http_user_agent: env::var("HTTP_USER_AGENT")
                .unwrap_or_else(|_| format!("cropcast/{}", env!("CARGO_PKG_VERSION"))),
            request_timeout_secs: parse_u64("REQUEST_TIMEOUT_SECS", 10).max(1),
            suggestion_debounce_ms: parse_u64("SUGGESTION_DEBOUNCE_MS", 300),
            geocode_debounce_ms: parse_u64("GEOCODE_DEBOUNCE_MS", 400),
            area_suggestion_limit: parse_usize("AREA_SUGGESTION_LIMIT", 5).max(1),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 1),
            soil_cache_ttl_secs: parse_u64("SOIL_CACHE_TTL_SECS", 3_600),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_overrides_and_ignores_blank_key() {
        env::set_var("GEOCODER_BASE_URL", "http://localhost:9999");
        env::set_var("GEOCODE_DEBOUNCE_MS", "50");
        env::set_var("TELEMETRY_ENABLED", "false");
        env::set_var("GEOCODER_API_KEY", "   ");

        let config = AppConfig::from_env();

        assert_eq!(config.geocoder_base_url, "http://localhost:9999");
        assert_eq!(config.geocode_debounce_ms, 50);
        assert!(!config.telemetry_enabled);
        assert!(config.geocoder_api_key.is_none());
        assert_eq!(config.soil_api_base_url, DEFAULT_SOIL_API_BASE_URL);
        assert_eq!(config.suggestion_debounce_ms, 300);
        assert_eq!(
            config.telemetry_buffer_max_bytes,
            DEFAULT_TELEMETRY_BUFFER_MAX_BYTES
        );
        assert_eq!(
            config.telemetry_buffer_max_files,
            DEFAULT_TELEMETRY_BUFFER_MAX_FILES
        );
    }
}
