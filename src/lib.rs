pub mod api;
pub mod batch;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod monte_carlo;
pub mod optimizer;
pub mod optimizer_status;
pub mod param_utils;
pub mod performance;
pub mod portfolio;
pub mod signals;
pub mod strategy;
pub mod strategy_utils;
pub mod walk_forward;

#[cfg(test)]
mod test_support;
