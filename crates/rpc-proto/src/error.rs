use thiserror::Error;

/// Errors raised by the [`crate::codec::Codec`] registry.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown runtime type for encoding: {0}")]
    UnknownType(String),

    #[error("unknown extension code: {0}")]
    UnknownExtType(i8),

    #[error("unknown record name: {0}")]
    UnknownRecord(String),

    #[error("malformed wire data: {0}")]
    Malformed(String),
}

/// Well-known error kinds a client can reconstruct from a Failure's
/// `class_name` without falling back to [`crate::error::RpcError::WrappedFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinErrorKind {
    KeyError,
    IndexError,
    TypeError,
    ValueError,
    AttributeError,
    RuntimeError,
}

impl BuiltinErrorKind {
    /// Maps the bare class-name string carried on the wire to a builtin
    /// kind. Any name not in this table is surfaced as a wrapped failure.
    pub fn from_class_name(name: &str) -> Option<Self> {
        Some(match name {
            "KeyError" => Self::KeyError,
            "IndexError" => Self::IndexError,
            "TypeError" => Self::TypeError,
            "ValueError" => Self::ValueError,
            "AttributeError" => Self::AttributeError,
            "RuntimeError" => Self::RuntimeError,
            _ => return None,
        })
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::AttributeError => "AttributeError",
            Self::RuntimeError => "RuntimeError",
        }
    }
}

/// Errors raised to an RPC caller, either locally (client-side) or
/// reconstructed from a server-published Failure envelope.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{kind:?}: {args:?}")]
    Builtin {
        kind: BuiltinErrorKind,
        args: Vec<crate::value::Value>,
    },

    #[error("server raised {class_name}: {args:?}")]
    WrappedFailure {
        class_name: String,
        args: Vec<crate::value::Value>,
    },

    #[error("rpc call timed out")]
    Timeout,

    #[error("publish reached no subscriber")]
    NotDelivered,

    #[error("subscription is already closed")]
    SubscriptionClosed,

    #[error("connection closed while call was in flight")]
    ConnectionClosed,

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("namespace already registered: {0}")]
    NamespaceCollision(String),

    #[error("executor has no streaming method")]
    NotImplemented,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
