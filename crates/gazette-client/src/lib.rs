//! Client side of the Gazette content API.
//!
//! [`ClientCache`] memoizes outbound reads before they reach the network and
//! mirrors the server cache's contract: get, set, delete by tag and delete by
//! pattern. [`ApiClient`] wires it to `reqwest`.

pub mod cache;
pub mod client;
pub mod keys;

pub use cache::{ClientCache, ClientCacheConfig, SetOptions, WrapOptions};
pub use client::{ApiClient, ClientError};
pub use keys::cache_key;
