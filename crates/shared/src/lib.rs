//! Secretary Gateway Shared Types and Storage
//!
//! This crate contains the record types, the storage contract, and the
//! file-backed store shared by the gateway binaries.

pub mod error;
pub mod storage;
pub mod types;

pub use error::*;
pub use storage::{FileStorage, Storage};
pub use types::*;
