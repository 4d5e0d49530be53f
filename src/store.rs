//! In-memory key-value handlers behind the `kv.KV` service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::message::DynamicMessage;
use crate::schema::SchemaRegistry;
use crate::service::ServerDispatch;
use crate::shared_types::{self, GET, GET_RESPONSE, KV_SERVICE, SET, SET_RESPONSE};

#[derive(Debug, Default)]
pub struct KvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`; missing keys read as the empty string.
    pub fn get(&self, key: &str) -> String {
        self.entries().get(key).cloned().unwrap_or_default()
    }

    pub fn set(&self, key: String, value: String) {
        self.entries().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch table for the `kv.KV` service in `registry`, with `Get` and
    /// `Set` served from this store.
    pub fn dispatch(self: &Arc<Self>, registry: &SchemaRegistry) -> Result<ServerDispatch> {
        let service = registry
            .service(KV_SERVICE)
            .ok_or_else(|| Error::UnresolvedType {
                name: KV_SERVICE.to_owned(),
                referenced_by: shared_types::PACKAGE.to_owned(),
            })?;
        let get_response = service
            .method(GET)
            .map(|m| m.output_type().clone())
            .ok_or_else(|| unresolved(GET_RESPONSE))?;
        let set_response = service
            .method(SET)
            .map(|m| m.output_type().clone())
            .ok_or_else(|| unresolved(SET_RESPONSE))?;

        let mut dispatch = ServerDispatch::new(service);

        let store = Arc::clone(self);
        dispatch.register(GET, move |req| {
            let key = string_field(&req, "key")?;
            let value = store.get(&key);
            DynamicMessage::new(get_response.clone()).with("value", value)
        })?;

        let store = Arc::clone(self);
        dispatch.register(SET, move |req| {
            let key = string_field(&req, "key")?;
            let value = string_field(&req, "value")?;
            store.set(key, value);
            DynamicMessage::new(set_response.clone()).with("ok", true)
        })?;

        Ok(dispatch)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn string_field(msg: &DynamicMessage, name: &str) -> Result<String> {
    let value = msg.get(name)?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::TypeMismatch {
            field: format!("{}.{name}", msg.descriptor().full_name()),
            expected: "string".into(),
            found: value.kind_name(),
        })
}

fn unresolved(name: &str) -> Error {
    Error::UnresolvedType {
        name: name.to_owned(),
        referenced_by: KV_SERVICE.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::shared_types::{GET_REQUEST, SET_REQUEST};

    #[test]
    fn test_get_missing_key_is_empty() {
        let store = Arc::new(KvStore::new());
        let registry = shared_types::registry().unwrap();
        let dispatch = store.dispatch(&registry).unwrap();
        dispatch.ensure_complete().unwrap();

        let request = DynamicMessage::new(registry.message(GET_REQUEST).unwrap())
            .with("key", "nonexistent")
            .unwrap();
        let reply = dispatch
            .dispatch("kv.KV.Get", &codec::encode(&request))
            .unwrap();
        // Empty value is the default and is not written.
        assert!(reply.is_empty());
    }

    #[test]
    fn test_set_then_get() {
        let store = Arc::new(KvStore::new());
        let registry = shared_types::registry().unwrap();
        let dispatch = store.dispatch(&registry).unwrap();

        let set = DynamicMessage::new(registry.message(SET_REQUEST).unwrap())
            .with("key", "hello")
            .unwrap()
            .with("value", "world")
            .unwrap();
        let reply = dispatch
            .dispatch("kv.KV.Set", &codec::encode(&set))
            .unwrap();
        assert_eq!(&reply[..], &[0x08, 0x01]);
        assert_eq!(store.get("hello"), "world");
        assert_eq!(store.len(), 1);

        let get = DynamicMessage::new(registry.message(GET_REQUEST).unwrap())
            .with("key", "hello")
            .unwrap();
        let reply = dispatch
            .dispatch("kv.KV.Get", &codec::encode(&get))
            .unwrap();
        let response = codec::decode(&reply, &registry.message(GET_RESPONSE).unwrap()).unwrap();
        assert_eq!(response.get("value").unwrap().as_str(), Some("world"));
    }

    #[test]
    fn test_non_string_key_is_type_mismatch() {
        use crate::schema::{FieldDef, FieldType, MethodDef};

        let mut registry = SchemaRegistry::new();
        registry
            .define_message(GET_REQUEST, [FieldDef::new("key", 1, FieldType::Int32)])
            .unwrap();
        registry
            .define_message(GET_RESPONSE, [FieldDef::string("value", 1)])
            .unwrap();
        registry
            .define_message(
                SET_REQUEST,
                [FieldDef::string("key", 1), FieldDef::string("value", 2)],
            )
            .unwrap();
        registry
            .define_message(SET_RESPONSE, [FieldDef::bool("ok", 1)])
            .unwrap();
        registry
            .define_service(
                KV_SERVICE,
                [
                    MethodDef::new(GET, GET_REQUEST, GET_RESPONSE),
                    MethodDef::new(SET, SET_REQUEST, SET_RESPONSE),
                ],
            )
            .unwrap();

        let store = Arc::new(KvStore::new());
        let dispatch = store.dispatch(&registry).unwrap();
        let request = DynamicMessage::new(registry.message(GET_REQUEST).unwrap())
            .with("key", 7)
            .unwrap();
        let err = dispatch
            .dispatch("kv.KV.Get", &codec::encode(&request))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { ref field, ref found, .. }
                if field == "kv.GetRequest.key" && found == "i32"
        ));
    }

    #[test]
    fn test_dispatch_requires_kv_service() {
        let store = Arc::new(KvStore::new());
        let registry = SchemaRegistry::new();
        assert!(matches!(
            store.dispatch(&registry),
            Err(Error::UnresolvedType { .. })
        ));
    }
}
