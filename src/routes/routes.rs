//! Defines the HTTP surface of the offload service.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz`
//!   - `GET  /readyz`
//!
//! - **Host adapter**
//!   - `POST /events/transfer`: one "file organized" event
//!
//! - **Operator**
//!   - `GET  /stats`: counters and failure ledger
//!   - `GET  /history?local_path=...`: host history row for a file
//!   - `POST /admin/reload-mappings`: re-read path rules

use crate::{
    handlers::{
        event_handlers::{history_record, reload_mappings, stats, transfer_event},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router; the caller supplies `AppState` with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events/transfer", post(transfer_event))
        .route("/stats", get(stats))
        .route("/history", get(history_record))
        .route("/admin/reload-mappings", post(reload_mappings))
}
