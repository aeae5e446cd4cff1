//! Shared state handed to every HTTP handler.

use crate::services::{history_service::HistoryReconciler, pipeline::PipelineHandle};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub history: HistoryReconciler,
    pub pipeline: PipelineHandle,
}
