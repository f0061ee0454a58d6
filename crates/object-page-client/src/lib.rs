//! HTTP transport for the object page engine.
//!
//! Implements the core crate's `ObjectStore` port against the object
//! service's REST API with `reqwest`.

pub mod config;
pub mod error;
pub mod http;

pub use config::ClientConfig;
pub use error::ClientError;
pub use http::{encode_path, HttpObjectStore};
