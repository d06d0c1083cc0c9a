pub mod config;
pub mod identity;
pub mod jitter;
pub mod probe;
pub mod proxy;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
