use std::mem;
use std::sync::Arc;

use http::{Method, StatusCode};
use log::{debug, trace};
use parking_lot::Mutex;
use serde_json::Value;

use crate::conn::Connection;
use crate::host::HostAddr;
use crate::response::Response;
use crate::transport::{Connector, TcpConnector};
use crate::Error;

/// Body a server produces when it timed out reading the request head.
/// Classified as a request timeout alongside status 408.
const TIMEOUT_BODY: &[u8] = b"Illegal end of headers.";

/// Thread-safe connection pool for one host.
///
/// The pool caches at most `limit` idle connections; a limit of 0 caches
/// nothing. The limit bounds the idle cache only, never concurrency:
/// acquiring from an empty pool opens a new connection, and releasing
/// into a full pool closes the released one. All cache mutation is a
/// single atomic step under the pool lock.
#[derive(Debug)]
pub struct Pool {
    addr: HostAddr,
    limit: usize,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    /// New pool over plain TCP.
    pub fn new(host: &str, limit: usize) -> Result<Pool, Error> {
        Pool::with_connector(host, limit, Arc::new(TcpConnector))
    }

    /// New pool opening transports through the given connector.
    pub fn with_connector(
        host: &str,
        limit: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Pool, Error> {
        Ok(Pool {
            addr: HostAddr::parse(host)?,
            limit,
            connector,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// The host this pool serves.
    pub fn host(&self) -> &HostAddr {
        &self.addr
    }

    /// Max number of idle connections cached.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of idle connections currently cached.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Pop an idle connection, most recently released first, or open a
    /// new one.
    fn acquire(&self) -> Connection {
        match self.idle.lock().pop() {
            Some(conn) => {
                trace!("reusing idle connection to {}", self.addr);
                conn
            }
            None => Connection::new(self.addr.clone(), Arc::clone(&self.connector)),
        }
    }

    /// Return a connection to the idle cache, or drop it when the cache
    /// is at capacity.
    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.limit {
            idle.push(conn);
        } else {
            trace!("idle cache for {} full, discarding connection", self.addr);
        }
    }

    /// Send a request and return the completed response.
    ///
    /// Drives the [`sequence()`][Pool::sequence] to completion and keeps
    /// the final value. This is the call most users want.
    pub fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, Error> {
        let mut exchange = self.sequence(method, path, body);

        let mut last = None;
        while let Some(step) = exchange.advance()? {
            if let Step::Final(response) = step {
                last = Some(response);
            }
        }

        match last {
            Some(response) => Ok(response),
            // The exchange produces a final value in every branch.
            None => unreachable!(),
        }
    }

    /// The raw three-step exchange, for drivers that interleave requests
    /// to several hosts. See [`Exchange`].
    pub fn sequence(&self, method: Method, path: &str, body: Option<&Value>) -> Exchange<'_> {
        Exchange {
            pool: self,
            method,
            path: path.to_string(),
            body: body.cloned(),
            state: State::Acquire,
        }
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// EXCHANGE

/// One request/response exchange against a pool, as a restartable
/// sequence of exactly three [`Step`] values.
///
/// The uniform step count is a deliberate invariant, not an accident of
/// the failure path: a broadcast driver advances many exchanges in
/// lock-step rounds, and differing lengths would desynchronize the
/// rounds across hosts. See the [state graph][crate].
#[derive(Debug)]
pub struct Exchange<'a> {
    pool: &'a Pool,
    method: Method,
    path: String,
    body: Option<Value>,
    state: State,
}

#[derive(Debug)]
enum State {
    Acquire,
    Await(Connection),
    RetryAwait(Connection),
    Settle(Response),
    Done,
}

/// Values produced by an [`Exchange`].
#[derive(Debug)]
pub enum Step {
    /// The request was dispatched on an acquired or freshly opened
    /// connection.
    Sent,
    /// Outcome of the first receive attempt. `None` when a local
    /// transport failure was substituted for a response.
    Interim(Option<Response>),
    /// The settled response for the exchange.
    Final(Response),
}

impl Exchange<'_> {
    /// Number of values every exchange produces, in every branch.
    pub const STEPS: usize = 3;

    /// Advance the exchange by one step.
    ///
    /// Returns `Ok(None)` once all three values have been produced. The
    /// transport reads/writes behind [`Step::Sent`] and the receive steps
    /// are the only operations that block.
    pub fn advance(&mut self) -> Result<Option<Step>, Error> {
        match mem::replace(&mut self.state, State::Done) {
            State::Acquire => {
                let mut conn = self.pool.acquire();
                conn.send(&self.method, &self.path, self.body.as_ref())?;
                self.state = State::Await(conn);
                Ok(Some(Step::Sent))
            }

            State::Await(mut conn) => {
                // A pooled connection may have died between requests,
                // which surfaces as a reset or a garbled status line on
                // this read. Substitute "no response" and let the retry
                // decision below handle it.
                let first = match conn.receive() {
                    Ok(response) => Some(response),
                    Err(e) if e.is_disconnect() => {
                        debug!("no response from {}: {}", self.pool.host(), e);
                        None
                    }
                    Err(e) => return Err(e),
                };

                match first {
                    Some(response) if !is_timeout(&response) => {
                        self.pool.release(conn);
                        self.state = State::Settle(response.clone());
                        Ok(Some(Step::Interim(Some(response))))
                    }
                    first => {
                        // The connection is unusable. Re-send the
                        // identical request on a fresh transport; no
                        // further retries after this one.
                        debug!("retrying {} {} on a fresh transport", self.method, self.path);
                        conn.close();
                        conn.send(&self.method, &self.path, self.body.as_ref())?;
                        self.state = State::RetryAwait(conn);
                        Ok(Some(Step::Interim(first)))
                    }
                }
            }

            State::RetryAwait(mut conn) => {
                // Errors propagate now; the retried connection is not
                // returned to the pool.
                let response = conn.receive()?;
                Ok(Some(Step::Final(response)))
            }

            State::Settle(response) => Ok(Some(Step::Final(response))),

            State::Done => Ok(None),
        }
    }
}

fn is_timeout(response: &Response) -> bool {
    response.status() == StatusCode::REQUEST_TIMEOUT
        || response.status() == StatusCode::BAD_REQUEST && response.body() == TIMEOUT_BODY
}
