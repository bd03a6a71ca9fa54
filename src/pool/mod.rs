//! Device connection pooling.

mod registry;

pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionStats, PoolStats, RegistryConfig};
