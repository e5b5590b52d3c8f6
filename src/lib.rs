pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod harness;
pub mod metrics;
pub mod plan;
pub mod scheduler;
pub mod setup;
pub mod threshold;
