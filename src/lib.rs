//! Webhook-driven handle verification: authenticate payment webhooks, check
//! the claimant's proof post, and promote pending claims to verified records.

pub mod audit;
pub mod claims;
pub mod config;
pub mod content;
pub mod http_server;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod verification;
