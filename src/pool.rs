//! A fixed-size set of clients sharing one origin.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::client::{Builder as ClientBuilder, Client, ClientEvent};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::origin::{IntoOrigin, Origin};
use crate::request::Request;

/// Configuration for a [`Pool`].
#[derive(Clone, Debug, Default)]
pub struct Builder {
    connections: Option<usize>,
    client: ClientBuilder,
}

impl Builder {
    /// A builder with the default options: 100 connections, default client
    /// options.
    pub fn new() -> Builder {
        Builder {
            connections: None,
            client: ClientBuilder::new(),
        }
    }

    /// Number of clients in the pool. Default 100.
    pub fn connections(&mut self, connections: usize) -> &mut Builder {
        self.connections = Some(connections);
        self
    }

    /// Options applied to every member client.
    pub fn client(&mut self, client: ClientBuilder) -> &mut Builder {
        self.client = client;
        self
    }

    /// Build the pool. Member clients connect lazily.
    pub fn build(&self, origin: impl IntoOrigin) -> Result<Pool> {
        let origin = origin.into_origin()?;
        let connections = self.connections.unwrap_or(100).max(1);

        let mut clients = Vec::with_capacity(connections);
        for _ in 0..connections {
            clients.push(self.client.build(origin.clone())?);
        }

        let (events, _) = broadcast::channel(64);
        for client in &clients {
            let mut rx = client.subscribe();
            let tx = events.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Ok(Pool {
            inner: Arc::new(PoolInner {
                origin,
                clients,
                events,
            }),
        })
    }
}

struct PoolInner {
    origin: Origin,
    clients: Vec<Client>,
    events: broadcast::Sender<ClientEvent>,
}

/// A fixed-size array of [`Client`]s for one origin.
///
/// Dispatch picks the least-loaded member: the first client that is not
/// busy, falling back to the first whose queue still has room (busy only
/// because of write back-pressure), falling back to the first client
/// outright.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// A pool with default options.
    pub fn new(origin: impl IntoOrigin) -> Result<Pool> {
        Builder::new().build(origin)
    }

    /// Start configuring a pool.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The origin all members dispatch to.
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Queue a request on the least-busy member.
    ///
    /// Same contract as [`Client::dispatch`]: `false` means the chosen
    /// member needs to drain.
    pub fn dispatch(&self, req: Request, handler: impl Handler) -> bool {
        self.dispatch_boxed(req, Box::new(handler))
    }

    pub(crate) fn dispatch_boxed(&self, req: Request, handler: Box<dyn Handler>) -> bool {
        let clients = &self.inner.clients;
        let client = clients
            .iter()
            .find(|c| !c.busy())
            .or_else(|| clients.iter().find(|c| !c.full()))
            .unwrap_or(&clients[0]);
        client.dispatch_boxed(req, handler)
    }

    /// Close every member gracefully.
    pub async fn close(&self) {
        for client in &self.inner.clients {
            client.close().await;
        }
    }

    /// Destroy every member; queued requests error with `err`'s kind
    /// (default `UND_ERR_DESTROYED`).
    pub async fn destroy(&self, err: Option<Error>) {
        for client in &self.inner.clients {
            let member_err = err.as_ref().map(|e| e.clone_shallow());
            client.destroy(member_err).await;
        }
    }

    /// Sum of member pending counts.
    pub fn pending(&self) -> usize {
        self.inner.clients.iter().map(|c| c.pending()).sum()
    }

    /// Sum of member running counts.
    pub fn running(&self) -> usize {
        self.inner.clients.iter().map(|c| c.running()).sum()
    }

    /// Sum of member sizes.
    pub fn size(&self) -> usize {
        self.inner.clients.iter().map(|c| c.size()).sum()
    }

    /// Number of members holding a live connection.
    pub fn connected(&self) -> usize {
        self.inner.clients.iter().filter(|c| c.connected()).count()
    }

    /// True when every member is busy.
    pub fn busy(&self) -> bool {
        self.inner.clients.iter().all(|c| c.busy())
    }

    /// Subscribe to the merged event stream of every member.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Identity comparison: two handles for the same pool.
    pub(crate) fn same(a: &Pool, b: &Pool) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("origin", &self.inner.origin)
            .field("connections", &self.inner.clients.len())
            .field("connected", &self.connected())
            .finish()
    }
}
