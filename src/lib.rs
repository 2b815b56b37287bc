//! Gazette: a content site whose read paths sit behind a tiered response
//! cache that degrades from Redis to process memory.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
