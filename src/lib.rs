//! Schema-driven message codec and RPC stubs.
//!
//! - [`schema`]: descriptors and the [`SchemaRegistry`] that owns them
//! - [`message`]: [`DynamicMessage`] instances with proto3 default semantics
//! - [`codec`]: the tag/value binary wire format
//! - [`service`]: client stubs and server dispatch over a [`Transport`]
//!
//! The key-value service in [`shared_types`] is the schema the `kv-server`
//! and `kv-client` binaries speak.

pub mod codec;
pub mod config;
pub mod error;
pub mod limits;
pub mod message;
pub mod rpc;
pub mod schema;
pub mod service;
pub mod shared_types;
pub mod store;

pub use error::{BoxError, Error, Result};
pub use message::{DynamicMessage, Value};
pub use schema::{
    FieldDef, FieldDescriptor, FieldType, MessageDescriptor, MethodDef, MethodDescriptor,
    SchemaRegistry, ServiceDescriptor, WireType,
};
pub use service::{
    build_client_stub, build_server_dispatch, ClientStub, Handler, LocalTransport, MethodStub,
    ServerDispatch, Transport,
};
