//! Origin-keyed pool management.
//!
//! An [`Agent`] lazily creates one [`Pool`] per origin and evicts it once
//! it is both disconnected and empty. Eviction is driven by the pool's own
//! disconnect events, never by garbage collection. A process-wide default
//! agent is available through [`global_agent`] / [`set_global_agent`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;
use tracing::debug;

use crate::client::{Builder as ClientBuilder, ClientEvent};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::origin::{IntoOrigin, Origin};
use crate::pool::{Builder as PoolBuilder, Pool};
use crate::request::Request;

type Factory = Box<dyn Fn(&Origin) -> Result<Pool> + Send + Sync>;

/// Configuration for an [`Agent`].
pub struct Builder {
    connections: Option<usize>,
    client: ClientBuilder,
    factory: Option<Factory>,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("connections", &self.connections)
            .field("custom_factory", &self.factory.is_some())
            .finish()
    }
}

impl Builder {
    /// A builder with the default options.
    pub fn new() -> Builder {
        Builder {
            connections: None,
            client: ClientBuilder::new(),
            factory: None,
        }
    }

    /// Connections per pool. Default 100.
    pub fn connections(&mut self, connections: usize) -> &mut Builder {
        self.connections = Some(connections);
        self
    }

    /// Options applied to every client of every pool.
    pub fn client(&mut self, client: ClientBuilder) -> &mut Builder {
        self.client = client;
        self
    }

    /// Replace the pool factory entirely.
    pub fn factory<F>(&mut self, factory: F) -> &mut Builder
    where
        F: Fn(&Origin) -> Result<Pool> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Build the agent.
    pub fn build(&mut self) -> Agent {
        let factory = match self.factory.take() {
            Some(factory) => factory,
            None => {
                let connections = self.connections;
                let client = self.client.clone();
                Box::new(move |origin: &Origin| {
                    let mut builder = PoolBuilder::new();
                    if let Some(connections) = connections {
                        builder.connections(connections);
                    }
                    builder.client(client.clone());
                    builder.build(origin.clone())
                })
            }
        };
        Agent {
            inner: Arc::new(AgentInner {
                factory,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct AgentInner {
    factory: Factory,
    pools: Mutex<HashMap<Origin, Pool>>,
}

/// Maps origins to pools and dispatches across them.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// An agent with default options.
    pub fn new() -> Agent {
        Builder::new().build()
    }

    /// Start configuring an agent.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The pool serving `origin`, created on first use.
    pub fn pool(&self, origin: impl IntoOrigin) -> Result<Pool> {
        let origin = origin.into_origin()?;
        let mut pools = self.inner.pools.lock().unwrap();
        if let Some(pool) = pools.get(&origin) {
            return Ok(pool.clone());
        }
        let pool = (self.inner.factory)(&origin)?;
        pools.insert(origin.clone(), pool.clone());
        drop(pools);
        debug!(origin = %origin, "pool created");
        self.watch_idle(origin, pool.clone());
        Ok(pool)
    }

    /// Evict the pool once it is disconnected and empty.
    fn watch_idle(&self, origin: Origin, pool: Pool) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut rx = pool.subscribe();
            loop {
                match rx.recv().await {
                    Ok(ClientEvent::Disconnect { .. }) => {
                        if pool.connected() == 0 && pool.size() == 0 {
                            let inner = match weak.upgrade() {
                                Some(inner) => inner,
                                None => break,
                            };
                            let mut pools = inner.pools.lock().unwrap();
                            if let Some(current) = pools.get(&origin) {
                                if Pool::same(current, &pool) {
                                    pools.remove(&origin);
                                    debug!(origin = %origin, "idle pool evicted");
                                }
                            }
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Queue a request against `origin`'s pool.
    ///
    /// Same contract as [`crate::Client::dispatch`]; origin parse failures
    /// are delivered synchronously through the handler.
    pub fn dispatch(&self, origin: impl IntoOrigin, req: Request, handler: impl Handler) -> bool {
        self.dispatch_boxed(origin, req, Box::new(handler))
    }

    pub(crate) fn dispatch_boxed(
        &self,
        origin: impl IntoOrigin,
        req: Request,
        mut handler: Box<dyn Handler>,
    ) -> bool {
        let pool = match self.pool(origin) {
            Ok(pool) => pool,
            Err(err) => {
                handler.on_error(err);
                return true;
            }
        };
        pool.dispatch_boxed(req, handler)
    }

    /// Close every pool gracefully.
    pub async fn close(&self) {
        for pool in self.drain_pools() {
            pool.close().await;
        }
    }

    /// Destroy every pool.
    pub async fn destroy(&self, err: Option<Error>) {
        for pool in self.drain_pools() {
            let pool_err = err.as_ref().map(|e| e.clone_shallow());
            pool.destroy(pool_err).await;
        }
    }

    fn drain_pools(&self) -> Vec<Pool> {
        let mut pools = self.inner.pools.lock().unwrap();
        pools.drain().map(|(_, pool)| pool).collect()
    }

    /// Number of live pools.
    pub fn pools_len(&self) -> usize {
        self.inner.pools.lock().unwrap().len()
    }
}

impl Default for Agent {
    fn default() -> Agent {
        Agent::new()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("pools", &self.pools_len())
            .finish()
    }
}

// ===== the global agent =====

static GLOBAL: OnceLock<Mutex<Option<Agent>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Agent>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// The process-wide agent, created lazily on first use.
pub fn global_agent() -> Agent {
    let mut slot = global_slot().lock().unwrap();
    slot.get_or_insert_with(Agent::new).clone()
}

/// Replace the process-wide agent, returning the previous one if any.
pub fn set_global_agent(agent: Agent) -> Option<Agent> {
    global_slot().lock().unwrap().replace(agent)
}
