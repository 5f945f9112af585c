#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # elva
//!
//! elva is a pipelining HTTP/1.1 client: one connection, many in-flight
//! requests.
//!
//! The core type is [`Client`], a dispatcher bound to a single origin. It
//! owns one TCP (optionally TLS, optionally unix-socket) byte stream,
//! writes queued requests back-to-back onto it, parses responses
//! incrementally, and delivers them through a streaming [`Handler`]. On
//! top of that sit [`Pool`] (many clients, one origin), [`Agent`] (one
//! pool per origin), and [`RedirectAgent`] (3xx following).
//!
//! ## Dispatching
//!
//! The native interface is callback-driven: [`Client::dispatch`] takes a
//! [`Request`] and a [`Handler`] and returns immediately. Handlers receive
//! `on_connect`, `on_headers`, `on_data` (repeated), `on_complete`, or a single
//! `on_error`. The [`api`] module adapts this to futures for the common
//! buffered case:
//!
//! ```no_run
//! # async fn run() -> elva::Result<()> {
//! let client = elva::Client::new("http://example.com")?;
//! let res = elva::api::request(&client, elva::Request::get("/")).await?;
//! assert_eq!(res.status, 200);
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipelining
//!
//! With `pipelining > 1` the client keeps several requests in flight at
//! once and relies on HTTP/1.1's ordering guarantee to match responses.
//! If the connection drops mid-pipeline, the head request fails and the
//! idempotent tail is transparently re-issued on a fresh connection;
//! non-idempotent and streaming-body requests never share a pipeline.
//!
//! ## Errors
//!
//! Every failure surfaces exactly once per request, as an [`Error`]
//! carrying a stable code (`UND_ERR_*`, `HPE_*`); see [`Error::code`].

#[doc(hidden)]
pub use http;

pub use crate::body::Body;
pub use crate::client::{Client, ClientEvent};
pub use crate::connect::TlsOptions;
pub use crate::error::{Error, Result};
pub use crate::handler::{AbortHandle, FlowControl, Handler};
pub use crate::origin::{IntoOrigin, Origin, Scheme};
pub use crate::request::Request;
pub use crate::upgrade::Upgraded;

pub use crate::agent::{global_agent, set_global_agent, Agent};
pub use crate::pool::Pool;
pub use crate::redirect::RedirectAgent;

pub mod agent;
pub mod api;
mod body;
pub mod client;
mod common;
mod connect;
mod error;
mod handler;
mod origin;
pub mod pool;
mod proto;
pub mod redirect;
mod request;
pub mod upgrade;
