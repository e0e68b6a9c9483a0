#![deny(missing_docs)]

//! Core library for the sitedocs construction document pipeline.

/// HTTP routing over the tool dispatcher.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Model Context Protocol server implementation.
pub mod mcp;
/// Pipeline counters.
pub mod metrics;
/// Model roles, backends and the bounded model cache.
pub mod models;
/// Normative code detection and supersession checks.
pub mod normative;
/// Document processing pipeline.
pub mod pipeline;
/// Qdrant vector store integration.
pub mod qdrant;
/// Exponential backoff for retried operations.
pub mod retry;
/// Start-up wiring shared by the binaries.
pub mod runtime;
/// Graph, vector and document record stores.
pub mod stores;
/// Tool registry, dispatcher and result envelope.
pub mod tools;
