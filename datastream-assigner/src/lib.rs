pub mod config;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod group_id;
pub mod strategy;
pub mod throughput;
pub mod types;
pub mod util;
pub mod validation;
