//! Courier Server — handler-chain dispatch, outbound clients, and live endpoint resolution.

pub mod config;
pub mod endpoint;
pub mod logging;
pub mod schema;
pub mod service;
pub mod traits;

pub use config::DispatchConfig;
pub use traits::{
    OperationHandler, RegistryClient, SchemaProvider, TokenValidator, Transport,
    TransportRegistry,
};
