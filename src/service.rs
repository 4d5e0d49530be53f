//! Client stubs and server dispatch built from a [`ServiceDescriptor`].
//!
//! Both sides route by method full name (`kv.KV.Get`) and move encoded bytes
//! across a [`Transport`]. Nothing here blocks except the transport itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::codec;
use crate::error::{BoxError, Error, Result};
use crate::message::DynamicMessage;
use crate::schema::{MessageDescriptor, MethodDescriptor, ServiceDescriptor};

/// Request/response carrier used by client stubs.
///
/// Synchronous from the stub's point of view. Errors are passed through the
/// stub as [`Error::Transport`] without interpretation.
pub trait Transport {
    fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError> {
        (**self).call(method, request)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError> {
        (**self).call(method, request)
    }
}

/// Client-side call surface for one service.
pub struct ClientStub<T> {
    service: Arc<ServiceDescriptor>,
    transport: T,
}

/// Build a [`ClientStub`] for `service` over `transport`.
pub fn build_client_stub<T: Transport>(
    service: Arc<ServiceDescriptor>,
    transport: T,
) -> ClientStub<T> {
    ClientStub { service, transport }
}

impl<T: Transport> ClientStub<T> {
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// One callable per method, in declaration order.
    pub fn methods(&self) -> impl Iterator<Item = MethodStub<'_, T>> {
        self.service.methods().iter().map(|method| MethodStub {
            method,
            transport: &self.transport,
        })
    }

    /// Callable for the method named `name` (short name, e.g. `Get`).
    pub fn method(&self, name: &str) -> Result<MethodStub<'_, T>> {
        let method = self
            .service
            .method(name)
            .ok_or_else(|| Error::UnknownMethod {
                service: self.service.full_name().to_owned(),
                method: name.to_owned(),
            })?;
        Ok(MethodStub {
            method,
            transport: &self.transport,
        })
    }

    /// Shorthand for `self.method(name)?.call(request)`.
    pub fn call(&self, name: &str, request: &DynamicMessage) -> Result<DynamicMessage> {
        self.method(name)?.call(request)
    }
}

/// A single bound method of a [`ClientStub`].
pub struct MethodStub<'a, T> {
    method: &'a MethodDescriptor,
    transport: &'a T,
}

impl<T: Transport> MethodStub<'_, T> {
    pub fn descriptor(&self) -> &MethodDescriptor {
        self.method
    }

    /// Encode `request`, send it, decode the reply as the output type.
    pub fn call(&self, request: &DynamicMessage) -> Result<DynamicMessage> {
        ensure_type(self.method.full_name(), self.method.input_type(), request)?;

        let reply = self
            .transport
            .call(self.method.full_name(), codec::encode(request))
            .map_err(|source| Error::Transport { source })?;

        codec::decode(&reply, self.method.output_type())
    }
}

/// User handler: request in, response out.
pub type Handler = Box<dyn Fn(DynamicMessage) -> Result<DynamicMessage> + Send + Sync>;

/// Server-side routing table from method full name to handler.
pub struct ServerDispatch {
    service: Arc<ServiceDescriptor>,
    handlers: HashMap<String, Handler>,
}

/// Build a [`ServerDispatch`] from `(method name, handler)` pairs.
///
/// Methods without a handler are accepted here and fail when dispatched; use
/// [`ServerDispatch::ensure_complete`] to refuse an incomplete table up front.
pub fn build_server_dispatch<I, S>(
    service: Arc<ServiceDescriptor>,
    handlers: I,
) -> Result<ServerDispatch>
where
    I: IntoIterator<Item = (S, Handler)>,
    S: AsRef<str>,
{
    let mut dispatch = ServerDispatch::new(service);
    for (name, handler) in handlers {
        dispatch.insert(name.as_ref(), handler)?;
    }
    Ok(dispatch)
}

impl ServerDispatch {
    pub fn new(service: Arc<ServiceDescriptor>) -> Self {
        Self {
            service,
            handlers: HashMap::new(),
        }
    }

    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// Register `handler` for the method with short name `method`.
    pub fn register<F>(&mut self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(DynamicMessage) -> Result<DynamicMessage> + Send + Sync + 'static,
    {
        self.insert(method, Box::new(handler))
    }

    fn insert(&mut self, method: &str, handler: Handler) -> Result<()> {
        let descriptor = self
            .service
            .method(method)
            .ok_or_else(|| Error::UnknownMethod {
                service: self.service.full_name().to_owned(),
                method: method.to_owned(),
            })?;
        self.handlers
            .insert(descriptor.full_name().to_owned(), handler);
        Ok(())
    }

    /// Method full names this dispatch routes, in declaration order.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.service.methods().iter().map(MethodDescriptor::full_name)
    }

    /// Fails on the first declared method that has no handler.
    pub fn ensure_complete(&self) -> Result<()> {
        match self
            .service
            .methods()
            .iter()
            .find(|m| !self.handlers.contains_key(m.full_name()))
        {
            Some(missing) => Err(Error::UnimplementedMethod {
                method: missing.full_name().to_owned(),
            }),
            None => Ok(()),
        }
    }

    /// Decode `request` as the method's input, run the handler, encode the
    /// result as the method's output.
    pub fn dispatch(&self, method: &str, request: &[u8]) -> Result<Bytes> {
        let descriptor = self
            .service
            .method_by_full_name(method)
            .ok_or_else(|| Error::UnknownMethod {
                service: self.service.full_name().to_owned(),
                method: method.to_owned(),
            })?;
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| Error::UnimplementedMethod {
                method: method.to_owned(),
            })?;

        let input = codec::decode(request, descriptor.input_type())?;
        debug!(method, request_len = request.len(), "dispatching");
        let output = handler(input)?;
        ensure_type(method, descriptor.output_type(), &output)?;
        Ok(codec::encode(&output))
    }
}

impl fmt::Debug for ServerDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handled: Vec<_> = self.handlers.keys().collect();
        handled.sort();
        f.debug_struct("ServerDispatch")
            .field("service", &self.service.full_name())
            .field("handled", &handled)
            .finish()
    }
}

/// In-process transport that hands requests straight to a [`ServerDispatch`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    dispatch: Arc<ServerDispatch>,
}

impl LocalTransport {
    pub fn new(dispatch: Arc<ServerDispatch>) -> Self {
        Self { dispatch }
    }
}

impl Transport for LocalTransport {
    fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError> {
        Ok(self.dispatch.dispatch(method, &request)?)
    }
}

fn ensure_type(
    method: &str,
    expected: &Arc<MessageDescriptor>,
    msg: &DynamicMessage,
) -> Result<()> {
    if Arc::ptr_eq(expected, msg.descriptor()) {
        return Ok(());
    }
    Err(Error::TypeMismatch {
        field: method.to_owned(),
        expected: format!("message {}", expected.full_name()),
        found: format!("message {}", msg.descriptor().full_name()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::schema::{FieldDef, MethodDef, SchemaRegistry};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .define_message("kv.GetRequest", [FieldDef::string("key", 1)])
            .unwrap();
        registry
            .define_message("kv.GetResponse", [FieldDef::string("value", 1)])
            .unwrap();
        registry
            .define_message(
                "kv.SetRequest",
                [FieldDef::string("key", 1), FieldDef::string("value", 2)],
            )
            .unwrap();
        registry
            .define_message("kv.SetResponse", [FieldDef::bool("ok", 1)])
            .unwrap();
        registry
            .define_service(
                "kv.KV",
                [
                    MethodDef::new("Get", "kv.GetRequest", "kv.GetResponse"),
                    MethodDef::new("Set", "kv.SetRequest", "kv.SetResponse"),
                ],
            )
            .unwrap();
        registry
    }

    fn bar_dispatch(registry: &SchemaRegistry) -> ServerDispatch {
        let service = registry.service("kv.KV").unwrap();
        let response = registry.message("kv.GetResponse").unwrap();
        let mut dispatch = ServerDispatch::new(service);
        dispatch
            .register("Get", move |_req| {
                DynamicMessage::new(response.clone()).with("value", "bar")
            })
            .unwrap();
        dispatch
    }

    fn echo(request: DynamicMessage) -> Result<DynamicMessage> {
        Ok(request)
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn call(&self, _: &str, _: Bytes) -> std::result::Result<Bytes, BoxError> {
            Err("link down".into())
        }
    }

    struct RecordingTransport {
        calls: AtomicUsize,
        reply: Bytes,
    }

    impl Transport for RecordingTransport {
        fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError> {
            assert_eq!(method, "kv.KV.Get");
            assert_eq!(&request[..], &[0x0a, 0x03, b'f', b'o', b'o']);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_client_stub_get_round_trip() {
        let registry = registry();
        let dispatch = Arc::new(bar_dispatch(&registry));
        let stub = build_client_stub(
            registry.service("kv.KV").unwrap(),
            LocalTransport::new(dispatch),
        );

        let request = DynamicMessage::new(registry.message("kv.GetRequest").unwrap())
            .with("key", "foo")
            .unwrap();
        let response = stub.call("Get", &request).unwrap();

        assert_eq!(response.descriptor().full_name(), "kv.GetResponse");
        assert_eq!(response.get("value").unwrap().as_str(), Some("bar"));
    }

    #[test]
    fn test_stub_sends_full_name_and_encoded_request() {
        let registry = registry();
        let transport = RecordingTransport {
            calls: AtomicUsize::new(0),
            reply: Bytes::from_static(&[0x0a, 0x03, b'b', b'a', b'r']),
        };
        let stub = build_client_stub(registry.service("kv.KV").unwrap(), &transport);
        let request = DynamicMessage::new(registry.message("kv.GetRequest").unwrap())
            .with("key", "foo")
            .unwrap();

        let response = stub.method("Get").unwrap().call(&request).unwrap();
        assert_eq!(response.get("value").unwrap().as_str(), Some("bar"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stub_rejects_wrong_input_type() {
        let registry = registry();
        let transport = RecordingTransport {
            calls: AtomicUsize::new(0),
            reply: Bytes::new(),
        };
        let stub = build_client_stub(registry.service("kv.KV").unwrap(), &transport);
        let wrong = DynamicMessage::new(registry.message("kv.SetRequest").unwrap());

        let err = stub.call("Get", &wrong).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { ref field, .. } if field == "kv.KV.Get"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stub_propagates_transport_error() {
        let registry = registry();
        let stub = build_client_stub(registry.service("kv.KV").unwrap(), FailingTransport);
        let request = DynamicMessage::new(registry.message("kv.GetRequest").unwrap());

        let err = stub.call("Get", &request).unwrap_err();
        match err {
            Error::Transport { source } => assert_eq!(source.to_string(), "link down"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stub_unknown_method() {
        let registry = registry();
        let stub = build_client_stub(registry.service("kv.KV").unwrap(), FailingTransport);
        assert!(matches!(stub.method("Delete"), Err(Error::UnknownMethod { .. })));
        let names: Vec<_> = stub.methods().map(|m| m.descriptor().name().to_owned()).collect();
        assert_eq!(names, ["Get", "Set"]);
    }

    #[test]
    fn test_dispatch_unimplemented_method() {
        let registry = registry();
        let dispatch = bar_dispatch(&registry);

        assert!(matches!(
            dispatch.ensure_complete(),
            Err(Error::UnimplementedMethod { ref method }) if method == "kv.KV.Set"
        ));
        assert!(matches!(
            dispatch.dispatch("kv.KV.Set", &[]),
            Err(Error::UnimplementedMethod { .. })
        ));
    }

    #[test]
    fn test_dispatch_unknown_route() {
        let registry = registry();
        let dispatch = bar_dispatch(&registry);
        assert!(matches!(
            dispatch.dispatch("kv.KV.Delete", &[]),
            Err(Error::UnknownMethod { .. })
        ));
        let routes: Vec<_> = dispatch.routes().collect();
        assert_eq!(routes, ["kv.KV.Get", "kv.KV.Set"]);
    }

    #[test]
    fn test_register_unknown_method_fails() {
        let registry = registry();
        let result = build_server_dispatch(
            registry.service("kv.KV").unwrap(),
            [("Delete", Box::new(echo) as Handler)],
        );
        assert!(matches!(result, Err(Error::UnknownMethod { .. })));
    }

    #[test]
    fn test_dispatch_rejects_malformed_request() {
        let registry = registry();
        let dispatch = bar_dispatch(&registry);
        assert!(matches!(
            dispatch.dispatch("kv.KV.Get", &[0x0a, 0x05]),
            Err(Error::MalformedWireData { .. })
        ));
    }

    #[test]
    fn test_dispatch_checks_handler_output_type() {
        let registry = registry();
        // Echo handler returns the request type instead of the response type.
        let dispatch = build_server_dispatch(
            registry.service("kv.KV").unwrap(),
            [("Get", Box::new(echo) as Handler)],
        )
        .unwrap();
        assert!(matches!(
            dispatch.dispatch("kv.KV.Get", &[]),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_complete_dispatch() {
        let registry = registry();
        let set_response = registry.message("kv.SetResponse").unwrap();
        let mut dispatch = bar_dispatch(&registry);
        dispatch
            .register("Set", move |_| {
                DynamicMessage::new(set_response.clone()).with("ok", true)
            })
            .unwrap();
        dispatch.ensure_complete().unwrap();
        let reply = dispatch.dispatch("kv.KV.Set", &[]).unwrap();
        assert_eq!(&reply[..], &[0x08, 0x01]);
    }
}
