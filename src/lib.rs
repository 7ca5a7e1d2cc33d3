//! Offline-first catalog cache and user-status sync.
//!
//! The local SQLite store is the source of truth for reads; the remote
//! catalog refreshes it page by page and user statuses are reconciled
//! upload-first so local edits are never overwritten before they land.

pub mod auth;
pub mod cache_service;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod list;
pub mod logging;
pub mod model;
pub mod pattern;
pub mod remote;
pub mod retry;
pub mod reviews;
pub mod store;
pub mod sync;
