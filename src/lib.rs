// Stream Load - Library root

pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod mock_server;
pub mod outcome;
pub mod prompts;
pub mod report;
pub mod streaming;
