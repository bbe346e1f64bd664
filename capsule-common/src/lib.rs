//! # Capsule Common Library
//!
//! Shared code for the capsule sync client and its tools:
//! - Wire types for the remote capsule service (asset status, downloads, uploads)
//! - Event types (CapsuleEvent enum) and the EventBus
//! - Configuration loading
//! - Progress formatting helpers

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod format;

pub use api::types::{AssetStatus, CapsuleId, CloudStatus};
pub use error::{Error, Result};
