//! Wire envelope, dynamic value model and self-describing codec shared by
//! the transport, server and client crates.
//!
//! Nothing here talks to a broker or a socket — this crate only knows how
//! to turn an [`Envelope`] into bytes and back. [`Codec`] is the the single
//! entry point for that; everything else is the data model it works over.
//!
//! [`Envelope`] flattens to [`Value`] via [`Envelope::to_value`]/
//! [`Envelope::from_value`], which [`Codec`] then serializes — so neither
//! the envelope shape nor the value model needs to know about the other's
//! wire details.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod geometry;
pub mod numeric;
pub mod value;

pub use codec::Codec;
pub use envelope::{Call, Envelope, MethodCall, Payload};
pub use error::{BuiltinErrorKind, CodecError, RpcError};
pub use geometry::Geometry;
pub use numeric::{DType, NumericArray, StructuredArray};
pub use value::{Record, Value};
