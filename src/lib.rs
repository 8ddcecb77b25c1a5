//! default-key - Inline Block-Encryption Mapping Target
//!
//! A thin virtual block device over a real one. Every request is remapped
//! onto the backing device, and requests that carry data get an
//! encryption context: the mapping's key plus a Data Unit Number derived
//! from the request's position. The cipher itself runs in an external
//! inline-encryption engine.
//!
//! # Architecture
//!
//! ```text
//! table line → KeyMaterial → MappingConfig → KeyLifecycle (register)
//!                                  │
//!            Request ──────▶ RequestMapper ──────▶ BlockDevice::submit
//!                                  │
//!                            StatusReporter
//! ```
//!
//! # Modules
//!
//! - [`domain`] - Requests, encryption contexts and collaborator ports
//! - [`error`] - Error types
//! - [`inventory`] - YAML description of the mock backend
//! - [`key`] - Key material
//! - [`metrics`] - Mapping statistics and Prometheus counters
//! - [`mock`] - In-memory device, registry and cipher engine
//! - [`table`] - Table line parsing
//! - [`target`] - The mapping itself

pub mod domain;
pub mod error;
pub mod inventory;
pub mod key;
pub mod metrics;
pub mod mock;
pub mod table;
pub mod target;

// Re-export commonly used types
pub use domain::{
    BlockDevice, CipherEngine, CryptoContext, CryptoProfile, DeviceRegistry, MappedRequest,
    Request, RequestOp,
};
pub use error::{ConfigError, Error, KeyError, MapError, Result};
pub use key::{CipherMode, KeyMaterial, KeyType};
pub use target::{
    Completion, Mapping, MappingConfig, MappingOptions, RequestMapper, StatusReporter,
    StatusType, StatusView,
};
