//! Risk-signal extraction and escalation for relayed agent conversations.

pub mod agent_client;
pub mod auth;
pub mod config;
pub mod error;
pub mod escalation;
pub mod flags;
pub mod http_client;
pub mod interpreter;
pub mod normalizer;
pub mod retry;
pub mod session;
pub mod shutdown;
pub mod stream;
pub mod transcript;
pub mod widget;
