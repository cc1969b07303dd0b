pub mod config;
pub mod depgraph;
pub mod error;
pub mod explanation;
pub mod inference;
pub mod intent;
pub mod knowledge;
pub mod policy;
pub mod router;
pub mod store;
pub mod workflow;
