//! Courier Core — path templates, operation routes, encoding negotiation, and
//! the value types shared by the dispatch runtime.

pub mod context;
pub mod encoding;
pub mod endpoint;
pub mod operation;
pub mod path;

pub use context::InvocationContext;
pub use encoding::{
    Encoder, EncoderRegistry, EncodingNegotiator, JsonEncoder, NegotiationError, TextPlainEncoder,
};
pub use endpoint::{RawEndpoint, ServiceKey};
pub use operation::{
    OperationRoute, OperationSchema, ParamLocation, ParamType, ParameterBinding, ParameterSchema,
    RegistrationError, ServiceSchema,
};
pub use path::{concat_path, normalize_path, PathError, PathTemplate, PathValues};

