pub mod config;
pub mod error;
pub mod export;
pub mod geoip;
pub mod graph;
pub mod indexer;
pub mod isis;
pub mod migrate;
pub mod serviceability;
pub mod solana;
pub mod telemetry;
pub mod view;
