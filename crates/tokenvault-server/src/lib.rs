//! # tokenvault-server
//!
//! Wires the storage providers and the token services into an axum server.

pub mod config;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use server::{TokenVaultServer, build_app, build_state, connect_store};
