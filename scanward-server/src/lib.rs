//! # Scanward Server
//!
//! HTTP front end of the scan service: file and image scan submission, job
//! inspection and engine status, plus the engine bootstrap run at startup.

pub mod errors;
pub mod middleware;
pub mod routes;
pub mod startup;
pub mod state;

pub use routes::create_app;
pub use state::AppState;
