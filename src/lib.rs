//! Uploads newly organized media files to cloud storage, reconciles the
//! host's transfer history and optionally publishes share links.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
