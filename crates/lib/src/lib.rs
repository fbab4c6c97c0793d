//! Courier core library: consumes inbound envelopes from a queue, runs each through a
//! per-conversation agent session under a concurrency cap, and publishes the replies.

pub mod agent;
pub mod agent_ctx;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod init;
pub mod limiter;
pub mod publisher;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod session;
pub mod status;
pub mod transport;
