//! Pipeline components, leaves first: the remote client and path mapper, the
//! history reconciler, the upload pool, the share aggregator and the intake
//! that feeds them.

pub mod history_service;
pub mod intake;
pub mod notifier;
pub mod path_mapper;
pub mod pipeline;
pub mod remote_client;
pub mod share_aggregator;
pub mod share_policy;
pub mod upload_pool;
