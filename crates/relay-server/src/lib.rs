pub mod commands;
pub mod configuration;
pub mod logging;
pub mod metrics;
pub mod registration;
pub mod routes;
pub mod state;

pub use state::AppState;
