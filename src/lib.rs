//! Tagweld - diagram annotation orchestration for asset graphs.
//!
//! Library surface for integration tests and for embedding the
//! pipeline phases in other binaries. The `tagweld` CLI in
//! `src/main.rs` is the usual entry point.

pub mod cache;
pub mod config;
pub mod detect;
pub mod models;
pub mod services;
pub mod store;
pub mod text;
