//! Data models for the key lifecycle engine
//!
//! These types are used for server API serialization and engine addressing.

mod types;

pub use types::*;
