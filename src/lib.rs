//! Pooled json/http client transport.
//!
//! Use [`Connection`] for a persistent channel to a single host.
//! Use [`Pool`] for thread-safe connection reuse against a single host.
//! Use [`Resources`] for multiple hosts with unicast selection or broadcast.
//!
//! Request and response bodies are json ([`serde_json::Value`]). Responses
//! advertise `accept-encoding: gzip` and are transparently inflated. The
//! load balancing strategy in [`Resources`] is randomized, biased by the
//! number of idle connections cached per host. This inherently provides
//! limited failover, but applications must still handle errors as desired.
//!
//! # The exchange state machine
//!
//! A single request/response exchange against a pool is an [`Exchange`]:
//! a restartable sequence that produces exactly three [`Step`] values in
//! every branch, so that a driver can interleave exchanges against many
//! hosts in lock-step rounds.
//!
//! ```text
//!        ┌──────────────────┐
//!        │     Acquire      │  pop an idle connection, or open
//!        └──────────────────┘  a new one, and send the request
//!                  │
//!                  ▼                 #1 Step::Sent
//!        ┌──────────────────┐
//!     ┌──│      Await       │──┐ first receive attempt, local
//!     │  └──────────────────┘  │ failures become "no response"
//!     │                        │
//!     ▼                        ▼     #2 Step::Interim
//!  ┌──────────────────┐  ┌──────────────────┐
//!  │      Reuse       │  │      Retry       │  close, resend on a
//!  └──────────────────┘  └──────────────────┘  fresh transport
//!     │                        │
//!     ▼                        ▼     #3 Step::Final
//!        ┌──────────────────┐
//!        │       Done       │
//!        └──────────────────┘
//! ```
//!
//! The healthy branch returns the connection to the pool and repeats the
//! same response for #2 and #3. The retry branch closes the connection,
//! resends the identical request, and receives once more; no further
//! retries are attempted. [`Resources::broadcast`] advances one exchange
//! per target host through three rounds: round 1 dispatches every request
//! before any response is awaited in rounds 2 and 3, overlapping the
//! hosts' network latencies without threads.
//!
//! # Example
//!
//! ```no_run
//! use fanout::Resources;
//! use http::Method;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), fanout::Error> {
//! let resources = Resources::new(["search1:8080", "search2:8080"], 4)?;
//!
//! // One host, chosen by idle-connection bias.
//! let response = resources.unicast(Method::GET, "/status", None, &[])?;
//! println!("{}", response.decoded()?);
//!
//! // Every host, requests overlapped.
//! let body = json!({"q": "hello"});
//! for response in resources.broadcast(Method::POST, "/search", Some(&body), &[])? {
//!     println!("{}", response.decoded()?);
//! }
//! # Ok(()) }
//! ```
//!
//! # In scope:
//!
//! * Persistent connections with a bounded per-host idle cache
//! * Single-retry recovery from request timeouts and dead pooled sockets
//! * Randomized load-biased host selection and lock-step broadcast
//! * json bodies, gzip response inflation, advisory warning headers
//!
//! # Out of scope:
//!
//! * TLS (bring your own [`Connector`])
//! * Caller-exposed cancellation or deadlines
//! * OS-level parallelism — broadcast overlap is cooperative
//!
//! # The http crate
//!
//! Based on the [http crate](https://crates.io/crates/http) - a unified HTTP API for Rust.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod conn;
mod error;
mod host;
mod pool;
mod resources;
mod response;
mod transport;

#[cfg(test)]
pub(crate) mod test;

pub use conn::Connection;
pub use error::Error;
pub use host::HostAddr;
pub use pool::{Exchange, Pool, Step};
pub use resources::Resources;
pub use response::Response;
pub use transport::{Connector, TcpConnector, Transport};

/// Agent identity looked for in the `warning` response header.
///
/// A header of the form `299 fanout "message"` is surfaced as a
/// non-fatal [`log::warn!`] when the response body is decoded.
pub const AGENT: &str = "fanout";

/// Max number of headers to parse from an HTTP response.
pub const MAX_RESPONSE_HEADERS: usize = 128;
