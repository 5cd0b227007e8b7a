//! Huddle — SMS group-coordination service.

pub mod classifier;
pub mod config;
pub mod context;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod onboarding;
pub mod phone;
pub mod processor;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod timeparse;
pub mod transport;

pub use error::{Error, Result};
