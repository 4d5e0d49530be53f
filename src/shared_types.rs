use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{FieldDef, MethodDef, SchemaRegistry, ServiceDescriptor};

pub const PACKAGE: &str = "kv";

pub const GET_REQUEST: &str = "kv.GetRequest";
pub const GET_RESPONSE: &str = "kv.GetResponse";
pub const SET_REQUEST: &str = "kv.SetRequest";
pub const SET_RESPONSE: &str = "kv.SetResponse";

pub const KV_SERVICE: &str = "kv.KV";
pub const GET: &str = "Get";
pub const SET: &str = "Set";

/// Register the key-value schema:
///
/// ```text
/// message GetRequest  { string key = 1; }
/// message GetResponse { string value = 1; }
/// message SetRequest  { string key = 1; string value = 2; }
/// message SetResponse { bool ok = 1; }
/// service KV {
///   rpc Get(GetRequest) returns (GetResponse);
///   rpc Set(SetRequest) returns (SetResponse);
/// }
/// ```
pub fn register(registry: &mut SchemaRegistry) -> Result<Arc<ServiceDescriptor>> {
    registry.define_message(GET_REQUEST, [FieldDef::string("key", 1)])?;
    registry.define_message(GET_RESPONSE, [FieldDef::string("value", 1)])?;
    registry.define_message(
        SET_REQUEST,
        [FieldDef::string("key", 1), FieldDef::string("value", 2)],
    )?;
    registry.define_message(SET_RESPONSE, [FieldDef::bool("ok", 1)])?;
    registry.define_service(
        KV_SERVICE,
        [
            MethodDef::new(GET, GET_REQUEST, GET_RESPONSE),
            MethodDef::new(SET, SET_REQUEST, SET_RESPONSE),
        ],
    )
}

/// Fresh registry holding only the key-value schema.
pub fn registry() -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    register(&mut registry)?;
    Ok(registry)
}

/// Failure category reported back over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    UnknownMethod,
    Unimplemented,
    InvalidRequest,
    Internal,
}

/// Server-side error as seen by a remote client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::UnknownMethod { .. } => RemoteErrorKind::UnknownMethod,
            Error::UnimplementedMethod { .. } => RemoteErrorKind::Unimplemented,
            Error::MalformedWireData { .. }
            | Error::UnknownField { .. }
            | Error::TypeMismatch { .. } => RemoteErrorKind::InvalidRequest,
            _ => RemoteErrorKind::Internal,
        };
        RemoteError {
            kind,
            message: err.to_string(),
        }
    }
}

/// Byte-level RPC carrying schema-encoded payloads.
#[tarpc::service]
pub trait WireService {
    /// Invoke `method` (full name, e.g. `kv.KV.Get`) with an encoded request.
    async fn invoke(method: String, payload: Vec<u8>) -> Result<Vec<u8>, RemoteError>;
}
