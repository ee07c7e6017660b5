//! Invocation dispatch framework.
//!
//! 1. **Routing** (`registry`): `(path, method)` -> `OperationRoute`
//! 2. **Dispatch** (`dispatcher`): HTTP request -> `Invocation` -> HTTP response
//! 3. **Middleware** (`middleware`): Tower layers (load shedding, metrics)
//! 4. **Handler chain** (`chain`): ordered handlers with explicit completion signals
//! 5. **Handlers** (`handlers`): auth, deadline, producer and transport steps
//! 6. **Client** (`client`): outbound invocations to other services

pub mod chain;
pub mod client;
pub mod dispatcher;
pub mod handlers;
pub mod invocation;
pub mod middleware;
pub mod registry;

// Re-export key types for convenient access.
pub use chain::{from_fn, ChainError, Completion, Handler, HandlerChain, Responder};
pub use client::ServiceClient;
pub use dispatcher::{DispatchError, Dispatcher};
pub use invocation::{
    Invocation, InvocationError, InvocationKind, ProtocolViolation, Response, ViolationKind,
};
pub use registry::{RouteError, RouteMatch, RouteRegistry, RouteRegistryBuilder};
