//! cloudctl-core
//!
//! The device-access concurrency and caching layer of a remote Android
//! control plane. It bounds OS threads and memory independent of device
//! count, avoids duplicate device work under load, and keeps per-device
//! state consistent when devices misbehave.
//!
//! # Components
//!
//! - **WorkerPool**: fixed pool of OS threads for blocking device calls
//! - **ConnectionRegistry**: per-device handles with LRU, idle expiry and health
//! - **ResultCache**: short-TTL cache with request coalescing
//! - **BatchEngine**: groups detached events by kind
//! - **ChannelPool / EventDispatcher**: typed events against a device
//! - **StreamingSession**: per-socket subscription state and push tasks
//!
//! [`DeviceService`] wires them together for the router layer.

pub mod agent;
pub mod channel;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod pool;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod telemetry;

pub use error::{AgentError, DeviceError, ErrorKind};
pub use service::{DetachedEvent, DeviceService, ServiceConfig, ServiceStats};
