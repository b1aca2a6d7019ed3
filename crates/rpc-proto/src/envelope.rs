use crate::error::CodecError;
use crate::value::Value;

/// A single step in a call stack, e.g. the `.filter(id=1)` in
/// `node.filter(id=1).reproject_to('4326').coordinates`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl MethodCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.push((key.into(), value));
        self
    }
}

/// A chained attribute/method walk addressed to one namespace's executor,
/// e.g. `stack = [filter(id=1), reproject_to('4326'), coordinates]` applied
/// in order starting from the executor's root resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub uid: String,
    pub namespace: String,
    pub timeout_ms: u64,
    pub stack: Vec<MethodCall>,
    /// Topic the caller listens on for replies. `None` until the transport
    /// stamps it at publish time.
    pub reply_to: Option<String>,
}

impl Call {
    pub fn new(uid: impl Into<String>, namespace: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            uid: uid.into(),
            namespace: namespace.into(),
            timeout_ms,
            stack: Vec::new(),
            reply_to: None,
        }
    }

    pub fn with_stack(mut self, stack: Vec<MethodCall>) -> Self {
        self.stack = stack;
        self
    }
}

/// Either the payload itself, or a pointer to it in the sideband KV store
/// when it was too large to carry inline.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Inline(Value),
    SidebandKey(String),
}

/// The full set of messages a transport may carry between client and
/// server. `uid` always correlates back to the [`Call`] that triggered it,
/// except [`Envelope::Notice`] which is unsolicited.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Call),
    SubscribeRequest(Call),
    UnsubscribeRequest { uid: String, namespace: String },
    Result {
        uid: String,
        namespace: String,
        data: Payload,
    },
    DataPoint {
        uid: String,
        namespace: String,
        data: Payload,
    },
    Failure {
        uid: String,
        namespace: String,
        class_name: String,
        args: Vec<Value>,
    },
    Notice { message: String },
}

impl Envelope {
    /// The correlation id a client matches this envelope back to its
    /// pending call or subscription table entry. `None` for `Notice`.
    pub fn uid(&self) -> Option<&str> {
        match self {
            Envelope::Request(c) | Envelope::SubscribeRequest(c) => Some(&c.uid),
            Envelope::UnsubscribeRequest { uid, .. }
            | Envelope::Result { uid, .. }
            | Envelope::DataPoint { uid, .. }
            | Envelope::Failure { uid, .. } => Some(uid),
            Envelope::Notice { .. } => None,
        }
    }

    const TAG_REQUEST: &'static str = "request";
    const TAG_SUBSCRIBE: &'static str = "subscribe";
    const TAG_UNSUBSCRIBE: &'static str = "unsubscribe";
    const TAG_RESULT: &'static str = "result";
    const TAG_DATA_POINT: &'static str = "data_point";
    const TAG_FAILURE: &'static str = "failure";
    const TAG_NOTICE: &'static str = "notice";

    /// Flattens the envelope into the dynamic [`Value`] model so it can be
    /// handed to a [`crate::codec::Codec`]. Kept separate from the codec
    /// itself so the wire shape of the envelope tag lives next to the
    /// envelope definition.
    pub fn to_value(&self) -> Value {
        let mut map: Vec<(String, Value)> = Vec::new();
        let tag = |t: &str| ("type".to_string(), Value::Str(t.to_string()));
        match self {
            Envelope::Request(call) => {
                map.push(tag(Self::TAG_REQUEST));
                push_call(&mut map, call);
            }
            Envelope::SubscribeRequest(call) => {
                map.push(tag(Self::TAG_SUBSCRIBE));
                push_call(&mut map, call);
            }
            Envelope::UnsubscribeRequest { uid, namespace } => {
                map.push(tag(Self::TAG_UNSUBSCRIBE));
                map.push(("uid".into(), Value::Str(uid.clone())));
                map.push(("namespace".into(), Value::Str(namespace.clone())));
            }
            Envelope::Result {
                uid,
                namespace,
                data,
            } => {
                map.push(tag(Self::TAG_RESULT));
                map.push(("uid".into(), Value::Str(uid.clone())));
                map.push(("namespace".into(), Value::Str(namespace.clone())));
                push_payload(&mut map, data);
            }
            Envelope::DataPoint {
                uid,
                namespace,
                data,
            } => {
                map.push(tag(Self::TAG_DATA_POINT));
                map.push(("uid".into(), Value::Str(uid.clone())));
                map.push(("namespace".into(), Value::Str(namespace.clone())));
                push_payload(&mut map, data);
            }
            Envelope::Failure {
                uid,
                namespace,
                class_name,
                args,
            } => {
                map.push(tag(Self::TAG_FAILURE));
                map.push(("uid".into(), Value::Str(uid.clone())));
                map.push(("namespace".into(), Value::Str(namespace.clone())));
                map.push(("class_name".into(), Value::Str(class_name.clone())));
                map.push(("args".into(), Value::Array(args.clone())));
            }
            Envelope::Notice { message } => {
                map.push(tag(Self::TAG_NOTICE));
                map.push(("message".into(), Value::Str(message.clone())));
            }
        }
        Value::Map(map.into_iter().map(|(k, v)| (Value::Str(k), v)).collect())
    }

    /// Inverse of [`Envelope::to_value`].
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let Value::Map(pairs) = value else {
            return Err(CodecError::Malformed("envelope is not a map".into()));
        };
        let get = |key: &str| -> Option<&Value> {
            pairs
                .iter()
                .find(|(k, _)| matches!(k, Value::Str(s) if s == key))
                .map(|(_, v)| v)
        };
        let field_str = |key: &str| -> Result<String, CodecError> {
            get(key)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| CodecError::Malformed(format!("missing field {key}")))
        };
        let tag = field_str("type")?;
        Ok(match tag.as_str() {
            t if t == Self::TAG_REQUEST => Envelope::Request(pull_call(get, &field_str)?),
            t if t == Self::TAG_SUBSCRIBE => {
                Envelope::SubscribeRequest(pull_call(get, &field_str)?)
            }
            t if t == Self::TAG_UNSUBSCRIBE => Envelope::UnsubscribeRequest {
                uid: field_str("uid")?,
                namespace: field_str("namespace")?,
            },
            t if t == Self::TAG_RESULT => Envelope::Result {
                uid: field_str("uid")?,
                namespace: field_str("namespace")?,
                data: pull_payload(get)?,
            },
            t if t == Self::TAG_DATA_POINT => Envelope::DataPoint {
                uid: field_str("uid")?,
                namespace: field_str("namespace")?,
                data: pull_payload(get)?,
            },
            t if t == Self::TAG_FAILURE => Envelope::Failure {
                uid: field_str("uid")?,
                namespace: field_str("namespace")?,
                class_name: field_str("class_name")?,
                args: get("args")
                    .and_then(Value::as_array)
                    .map(|a| a.to_vec())
                    .unwrap_or_default(),
            },
            t if t == Self::TAG_NOTICE => Envelope::Notice {
                message: field_str("message")?,
            },
            other => return Err(CodecError::Malformed(format!("unknown envelope type {other}"))),
        })
    }
}

fn push_call(map: &mut Vec<(String, Value)>, call: &Call) {
    map.push(("uid".into(), Value::Str(call.uid.clone())));
    map.push(("namespace".into(), Value::Str(call.namespace.clone())));
    map.push(("timeout_ms".into(), Value::UInt(call.timeout_ms)));
    map.push((
        "reply_to".into(),
        call.reply_to.clone().map(Value::Str).unwrap_or(Value::Nil),
    ));
    let stack = call
        .stack
        .iter()
        .map(|step| {
            Value::Map(vec![
                (Value::Str("name".into()), Value::Str(step.name.clone())),
                (Value::Str("args".into()), Value::Array(step.args.clone())),
                (
                    Value::Str("kwargs".into()),
                    Value::Map(
                        step.kwargs
                            .iter()
                            .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                            .collect(),
                    ),
                ),
            ])
        })
        .collect();
    map.push(("stack".into(), Value::Array(stack)));
}

fn pull_call(
    get: impl Fn(&str) -> Option<&Value>,
    field_str: &impl Fn(&str) -> Result<String, CodecError>,
) -> Result<Call, CodecError> {
    let uid = field_str("uid")?;
    let namespace = field_str("namespace")?;
    let timeout_ms = match get("timeout_ms") {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| CodecError::Malformed("timeout_ms is not an integer".into()))?
            as u64,
        None => return Err(CodecError::Malformed("missing field timeout_ms".into())),
    };
    let reply_to = match get("reply_to") {
        Some(Value::Str(s)) => Some(s.clone()),
        _ => None,
    };
    let stack = get("stack")
        .and_then(Value::as_array)
        .ok_or_else(|| CodecError::Malformed("missing call stack".into()))?
        .iter()
        .map(pull_method_call)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Call {
        uid,
        namespace,
        timeout_ms,
        stack,
        reply_to,
    })
}

fn pull_method_call(value: &Value) -> Result<MethodCall, CodecError> {
    let Value::Map(pairs) = value else {
        return Err(CodecError::Malformed("stack entry is not a map".into()));
    };
    let get = |key: &str| pairs.iter().find(|(k, _)| matches!(k, Value::Str(s) if s == key)).map(|(_, v)| v);
    let name = get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("stack entry missing name".into()))?
        .to_string();
    let args = get("args")
        .and_then(Value::as_array)
        .map(|a| a.to_vec())
        .unwrap_or_default();
    let kwargs = match get("kwargs") {
        Some(Value::Map(pairs)) => pairs
            .iter()
            .map(|(k, v)| {
                k.as_str()
                    .map(|s| (s.to_string(), v.clone()))
                    .ok_or_else(|| CodecError::Malformed("kwarg key is not a string".into()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(MethodCall { name, args, kwargs })
}

fn push_payload(map: &mut Vec<(String, Value)>, payload: &Payload) {
    match payload {
        Payload::Inline(v) => map.push(("data".into(), v.clone())),
        Payload::SidebandKey(key) => map.push((
            "data".into(),
            Value::Map(vec![(Value::Str("kv_key".into()), Value::Str(key.clone()))]),
        )),
    }
}

fn pull_payload(get: impl Fn(&str) -> Option<&Value>) -> Result<Payload, CodecError> {
    match get("data") {
        Some(Value::Map(pairs)) if pairs.len() == 1 => {
            if let (Value::Str(k), Value::Str(key)) = &pairs[0] {
                if k == "kv_key" {
                    return Ok(Payload::SidebandKey(key.clone()));
                }
            }
            Ok(Payload::Inline(Value::Map(pairs.clone())))
        }
        Some(other) => Ok(Payload::Inline(other.clone())),
        None => Err(CodecError::Malformed("missing data field".into())),
    }
}
