#![deny(unsafe_code)]

/// Terminal front-end.
pub mod app;
/// Streaming conversation core: accumulation, reveal pacing and disclosure.
pub mod chat;
/// Settings persistence.
pub mod settings;
