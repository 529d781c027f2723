//! TokenScope backend library
//!
//! Live trade feed for a single token: pushed trades and metrics reconciled
//! with paginated history, exposed to a presentation client over HTTP and
//! WebSocket.

pub mod api;
pub mod config;
pub mod feed;
pub mod format;
pub mod models;
pub mod scrapers;
pub mod storage;
