//! tarpc plumbing: the server side of [`WireService`] and a [`Transport`]
//! that carries client stub calls over a tarpc client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future;
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use crate::error::{BoxError, Error, Result};
use crate::service::{ServerDispatch, Transport};
use crate::shared_types::{RemoteError, WireService, WireServiceClient};

/// Serves [`WireService`] by handing each call to a [`ServerDispatch`].
#[derive(Clone, Debug)]
pub struct WireServer {
    dispatch: Arc<ServerDispatch>,
}

impl WireServer {
    pub fn new(dispatch: Arc<ServerDispatch>) -> Self {
        Self { dispatch }
    }
}

impl WireService for WireServer {
    // Dispatch is CPU-only, so the reply is ready immediately.
    type InvokeFut = future::Ready<std::result::Result<Vec<u8>, RemoteError>>;

    fn invoke(self, _: context::Context, method: String, payload: Vec<u8>) -> Self::InvokeFut {
        let reply = self
            .dispatch
            .dispatch(&method, &payload)
            .map(|bytes| bytes.to_vec())
            .map_err(|err| {
                debug!(%method, error = %err, "call failed");
                RemoteError::from(err)
            });
        future::ready(reply)
    }
}

/// [`Transport`] over a tarpc [`WireServiceClient`].
///
/// Each call blocks the current tokio worker until the reply arrives or the
/// deadline passes, so it only works on a multi-threaded runtime. Both
/// construction and calls refuse a `current_thread` runtime with an error.
#[derive(Debug)]
pub struct TarpcTransport {
    client: WireServiceClient,
    handle: Handle,
    timeout: Duration,
}

impl TarpcTransport {
    /// Wrap an existing client. Must be called from inside a multi-threaded
    /// tokio runtime.
    pub fn new(client: WireServiceClient, timeout: Duration) -> Result<Self> {
        let handle = blocking_handle().map_err(|source| Error::Transport { source })?;
        Ok(Self {
            client,
            handle,
            timeout,
        })
    }

    /// Connect over TCP with JSON framing.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let transport = tarpc::serde_transport::tcp::connect(addr, Json::default)
            .await
            .map_err(|e| Error::Transport { source: e.into() })?;
        let client = WireServiceClient::new(client::Config::default(), transport).spawn();
        Self::new(client, timeout)
    }
}

/// Handle of the current runtime, if it can host `block_in_place`.
fn blocking_handle() -> std::result::Result<Handle, BoxError> {
    let handle = Handle::try_current()?;
    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => {
            Err("blocking calls need a multi-threaded tokio runtime".into())
        }
        _ => Ok(handle),
    }
}

impl Transport for TarpcTransport {
    fn call(&self, method: &str, request: Bytes) -> std::result::Result<Bytes, BoxError> {
        // block_in_place panics on a current_thread runtime.
        if Handle::try_current().is_ok() {
            blocking_handle()?;
        }

        let mut ctx = context::current();
        ctx.deadline = SystemTime::now() + self.timeout;

        let reply = tokio::task::block_in_place(|| {
            self.handle
                .block_on(self.client.invoke(ctx, method.to_owned(), request.to_vec()))
        })?;
        Ok(Bytes::from(reply?))
    }
}
