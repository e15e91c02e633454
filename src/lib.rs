mod config;
mod coordinate;
mod crops;
mod debounce;
mod errors;
mod geocode;
mod score;
mod session;
mod soil;
mod telemetry;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use coordinate::Coordinate;
pub use errors::{AppError, AppResult};
pub use geocode::GeocodeMatch;
pub use score::{ScoreFactor, ScoreResult};
pub use session::{DashboardSession, PanelState, SessionSnapshot, SoilReading};
pub use soil::SoilSource;

pub(crate) fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,cropcast=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
