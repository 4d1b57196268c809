//! Key server API
//!
//! [`KeyServer`] is the seam the engine talks to the relay server through;
//! [`ApiClient`] implements it over HTTP.

mod client;

pub use client::{ApiClient, KeyServer};
