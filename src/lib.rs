pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod index;
pub mod layers;
pub mod orchestrator;
pub mod output;
pub mod resolve;
pub mod store;
