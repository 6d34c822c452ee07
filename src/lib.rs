pub mod args;
pub mod bgp;
pub mod hops;
pub mod netcheck;
pub mod packet;
pub mod report;
pub mod route;
pub mod targets;
pub mod tracer;
pub mod utils;

// Re-export commonly used types
pub use args::Args;
pub use hops::{Hop, Node};
pub use tracer::{Config, Reply, TraceError, Tracer};

// Re-export external dependencies commonly used across modules
pub use anyhow::Result;
pub use std::net::IpAddr;
pub use std::time::Duration;
