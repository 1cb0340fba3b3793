//! Named request/reply endpoints on top of [`MessageBus`].
//!
//! A component calls [`MessageBus::serve`] once to own an endpoint and then
//! drains [`ServiceHandle::next`].  Callers use [`MessageBus::request`] with a
//! deadline.  A timed-out request is never retried: the server may already
//! have applied it, so the outcome is reported as unknown.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::bus::{MessageBus, lock};
use crate::error::ChannelError;

/// A named request/reply channel taking `Req` and answering with `Resp`.
pub struct Endpoint<Req, Resp> {
    name: Arc<str>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Endpoint<Req, Resp> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Endpoint<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Endpoint").field(&self.name).finish()
    }
}

/// An incoming request. Answer it with [`Request::respond`].
pub struct Request<Req, Resp> {
    payload: Req,
    reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> Request<Req, Resp> {
    pub fn payload(&self) -> &Req {
        &self.payload
    }

    /// Send the reply. Returns `false` when the caller has already given up.
    pub fn respond(self, response: Resp) -> bool {
        self.reply.send(response).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Type-erased endpoint registry entry
// ---------------------------------------------------------------------------

trait ErasedSender: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn is_closed(&self) -> bool;
}

impl<T: Send + 'static> ErasedSender for mpsc::Sender<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

pub(crate) struct EndpointSlot {
    request_type: TypeId,
    type_name: &'static str,
    sender: Box<dyn ErasedSender>,
}

/// Server side of an endpoint, returned by [`MessageBus::serve`].
///
/// Dropping the handle releases the endpoint name.
pub struct ServiceHandle<Req, Resp> {
    name: Arc<str>,
    rx: mpsc::Receiver<Request<Req, Resp>>,
}

impl<Req, Resp> ServiceHandle<Req, Resp> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next request. `None` once every caller handle is gone.
    pub async fn next(&mut self) -> Option<Request<Req, Resp>> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Request<Req, Resp>> {
        self.rx.try_recv().ok()
    }
}

impl MessageBus {
    /// Claim `endpoint` and start accepting up to `capacity` pending requests.
    ///
    /// # Errors
    ///
    /// [`ChannelError::EndpointTaken`] when a live server already owns the
    /// name.
    pub fn serve<Req, Resp>(
        &self,
        endpoint: &Endpoint<Req, Resp>,
        capacity: usize,
    ) -> Result<ServiceHandle<Req, Resp>, ChannelError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut endpoints = lock(&self.inner.endpoints);
        if let Some(existing) = endpoints.get(endpoint.name()) {
            if !existing.sender.is_closed() {
                return Err(ChannelError::EndpointTaken(endpoint.name().to_string()));
            }
        }
        let (tx, rx) = mpsc::channel::<Request<Req, Resp>>(capacity.max(1));
        endpoints.insert(
            endpoint.name().to_string(),
            EndpointSlot {
                request_type: TypeId::of::<Request<Req, Resp>>(),
                type_name: std::any::type_name::<Req>(),
                sender: Box::new(tx),
            },
        );
        debug!(endpoint = endpoint.name(), "endpoint served");
        Ok(ServiceHandle {
            name: Arc::clone(&endpoint.name),
            rx,
        })
    }

    /// Send `request` to `endpoint` and wait at most `timeout` for the reply.
    ///
    /// The endpoint is resolved at call time, so a server that restarts is
    /// picked up by the next call.
    ///
    /// # Errors
    ///
    /// * [`ChannelError::NoSuchEndpoint`] – nobody serves the name.
    /// * [`ChannelError::TypeMismatch`] – the server takes a different type.
    /// * [`ChannelError::Closed`] – the server went away before replying.
    /// * [`ChannelError::Timeout`] – no reply in time; outcome unknown.
    pub async fn request<Req, Resp>(
        &self,
        endpoint: &Endpoint<Req, Resp>,
        request: Req,
        timeout: Duration,
    ) -> Result<Resp, ChannelError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let name = endpoint.name().to_string();
        let tx = {
            let endpoints = lock(&self.inner.endpoints);
            let slot = endpoints
                .get(&name)
                .filter(|slot| !slot.sender.is_closed())
                .ok_or_else(|| ChannelError::NoSuchEndpoint(name.clone()))?;
            if slot.request_type != TypeId::of::<Request<Req, Resp>>() {
                return Err(ChannelError::TypeMismatch {
                    name: name.clone(),
                    bound: slot.type_name.to_string(),
                    requested: std::any::type_name::<Req>().to_string(),
                });
            }
            slot.sender
                .as_any()
                .downcast_ref::<mpsc::Sender<Request<Req, Resp>>>()
                .cloned()
                .ok_or_else(|| ChannelError::NoSuchEndpoint(name.clone()))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            tx.send(Request {
                payload: request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelError::Closed(name.clone()))?;
            reply_rx
                .await
                .map_err(|_| ChannelError::Closed(name.clone()))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                endpoint: name,
                timeout,
            }),
        }
    }

    /// Names of all live endpoints, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let endpoints = lock(&self.inner.endpoints);
        let mut names: Vec<String> = endpoints
            .iter()
            .filter(|(_, slot)| !slot.sender.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Endpoint<String, String> {
        Endpoint::new("test/echo")
    }

    #[tokio::test]
    async fn request_gets_reply() {
        let bus = MessageBus::new();
        let mut server = bus.serve(&echo(), 4).unwrap();
        tokio::spawn(async move {
            while let Some(req) = server.next().await {
                let reply = format!("echo: {}", req.payload());
                req.respond(reply);
            }
        });

        let reply = bus
            .request(&echo(), "hi".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "echo: hi");
    }

    #[tokio::test]
    async fn unknown_endpoint_fails_fast() {
        let bus = MessageBus::new();
        let err = bus
            .request(&echo(), "hi".to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::NoSuchEndpoint("test/echo".to_string()));
    }

    #[tokio::test]
    async fn silent_server_times_out_with_unknown_outcome() {
        let bus = MessageBus::new();
        let mut server = bus.serve(&echo(), 4).unwrap();
        let err = bus
            .request(&echo(), "hi".to_string(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_unknown_outcome());
        // The request did reach the server even though the caller gave up.
        let delivered = server.try_next().expect("request was queued");
        assert!(!delivered.respond("late".to_string()));
    }

    #[tokio::test]
    async fn endpoint_cannot_be_served_twice_while_alive() {
        let bus = MessageBus::new();
        let first = bus.serve(&echo(), 1).unwrap();
        assert!(matches!(
            bus.serve(&echo(), 1),
            Err(ChannelError::EndpointTaken(_))
        ));
        assert_eq!(bus.endpoints(), vec!["test/echo".to_string()]);

        drop(first);
        assert!(bus.endpoints().is_empty());
        assert!(bus.serve(&echo(), 1).is_ok());
    }

    #[tokio::test]
    async fn wrong_request_type_is_rejected() {
        let bus = MessageBus::new();
        let _server = bus.serve(&echo(), 1).unwrap();
        let numeric: Endpoint<u32, u32> = Endpoint::new("test/echo");
        let err = bus
            .request(&numeric, 7, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn dropped_server_reports_closed() {
        let bus = MessageBus::new();
        let mut server = bus.serve(&echo(), 4).unwrap();
        tokio::spawn(async move {
            // Take one request, then drop it without replying.
            let _ = server.next().await;
        });
        let err = bus
            .request(&echo(), "hi".to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Closed("test/echo".to_string()));
    }
}
