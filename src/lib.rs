pub mod backlog;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod reconciler;
pub mod record;
pub mod relay;
pub mod sample_store;
pub mod scheduler;
pub mod signals;
pub mod telemetry;

pub use logging::init_tracing;
pub use relay::Relay;
