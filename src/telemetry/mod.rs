pub mod latency;
pub mod rpc;
pub mod usage;
