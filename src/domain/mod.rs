//! Domain Layer
//!
//! - **Request** (`request.rs`) - requests, mapped requests and encryption contexts
//! - **Ports** (`ports.rs`) - traits for the backing device, device registry and cipher engine

pub mod ports;
pub mod request;

pub use ports::{BlockDevice, CipherEngine, CryptoProfile, DeviceRegistry};
pub use request::{
    CryptoContext, MappedRequest, Request, RequestOp, SECTOR_SHIFT, SECTOR_SIZE,
};
