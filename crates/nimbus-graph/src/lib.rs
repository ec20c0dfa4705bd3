//! Microsoft Graph drive adapter.
//!
//! Implements the [`RemoteDrive`] port over the Graph API v1.0:
//! item metadata, directory listing, content download, small and
//! resumable uploads, delta paging, the change-notification
//! subscription, and deletion — all with bearer authentication through
//! a [`TokenProvider`], retry-with-backoff for transient failures,
//! offline classification, and a short-TTL cache for idempotent GETs.
//!
//! [`RemoteDrive`]: nimbus_core::ports::RemoteDrive
//! [`TokenProvider`]: nimbus_core::ports::TokenProvider

pub mod auth;
pub mod cache;
pub mod client;
pub mod error;
pub mod offline;
pub mod types;
pub mod upload;

pub use auth::{FileTokenProvider, Tokens};
pub use client::GraphClient;
pub use upload::SessionPersistence;
