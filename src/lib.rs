//! Replaybook: record UI interactions in a Chrome-family browser and replay
//! them as automated test cases over the DevTools protocol.

pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod recorder;
pub mod runner;
pub mod scheduler;
pub mod suite;

pub use error::{ReplayError, Result};
