//! Incremental, idempotent Gmail archiver.
//!
//! Messages are archived into an [`store::EmailStore`] directory in two
//! tiers: metadata first, content once fetched. [`sync::SyncCoordinator`]
//! brings the store up to date with a remote query, [`merge::CandidateMerge`]
//! records candidates as pending, [`backfill::Backfill`] fills pending
//! content, and [`export::Exporter`] renders populated records.

pub mod auth;
pub mod backfill;
pub mod cancel;
pub mod config;
pub mod error;
pub mod export;
pub mod gmail;
pub mod merge;
pub mod models;
pub mod provider;
pub mod store;
pub mod sync;
