pub mod appearance;
pub mod artifact;
pub mod calibration;
pub mod combiner;
pub mod config;
pub mod error;
pub mod fake_league;
pub mod features;
pub mod history;
pub mod linear;
pub mod metrics;
pub mod minutes_model;
pub mod pipeline;
pub mod start_model;
pub mod store;
pub mod training;

pub use appearance::{Appearance, MatchContext, PeriodKey, PlayerHistory, PlayerProfile, Position};
pub use combiner::{PredictionResult, PredictionSource};
pub use config::PipelineConfig;
pub use error::{Stage, XMinsError, XResult};
pub use pipeline::{ModelBundle, ModelHandle, PredictionRequest};

/// Stderr subscriber honouring `RUST_LOG`, `info` by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
