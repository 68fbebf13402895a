//! HTTP surface: every path and method goes to the push webhook handler

pub mod webhook;

use axum::Router;

use crate::SharedState;

pub use webhook::handle_webhook;

pub fn router(state: SharedState) -> Router {
    Router::new().fallback(handle_webhook).with_state(state)
}
