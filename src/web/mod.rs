//! The web module for handling the Axum API.

pub mod api;

pub use api::{app_with_state, create_router, AppState};
