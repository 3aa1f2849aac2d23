#![deny(missing_docs)]

//! Core library for the curriculum import pipeline.

/// Deterministic similarity clustering of embedded outcomes.
pub mod cluster;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction, cache, and batch generator.
pub mod embedding;
/// Plain-text extraction from PDF, DOC, DOCX, and TXT documents.
pub mod extract;
/// Import lifecycle state machine and review surface.
pub mod import;
/// Structured logging and tracing setup.
pub mod logging;
/// Import pipeline metrics helpers.
pub mod metrics;
/// Persisted entities and lifecycle enums.
pub mod model;
/// AI-backed outcome parsing with schema validation.
pub mod parser;
/// Timeout and backoff around external capability calls.
pub mod retry;
/// Persistence interface and in-memory store.
pub mod store;
