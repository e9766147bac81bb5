pub mod app;
pub mod chat;
pub mod cli;
pub mod error;
pub mod mcp;
pub mod models;
pub mod platform;
pub mod server;

pub use error::{Error, Result};
