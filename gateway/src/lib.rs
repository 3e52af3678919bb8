pub mod audit;
pub mod canonical;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod hash_chain;
pub mod kv;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod rate_limit;
pub mod replay;
pub mod rules;
pub mod state;

pub use state::AppState;
