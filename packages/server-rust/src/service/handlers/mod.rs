//! Representative handlers for inbound and outbound chains.
//!
//! A typical producer chain is `auth → deadline → producer`; a consumer chain
//! is `deadline → transport`.

pub mod auth;
pub mod deadline;
pub mod producer;
pub mod transport;

pub use auth::{AuthHandler, JwtTokenValidator, StaticTokenValidator};
pub use deadline::DeadlineHandler;
pub use producer::ProducerHandler;
pub use transport::TransportHandler;
