#![forbid(unsafe_code)]

pub mod acp;
pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod realtime;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
