//! Scripted transports for driving exchanges without sockets.
//!
//! A [`FakeConnector`] serves a queue of scripted transports per host.
//! Each transport holds a list of canned responses; every request write
//! unlocks the next response for reading. All wire activity is recorded
//! as an ordered [`Event`] list, which is what the broadcast ordering
//! tests assert against.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::HostAddr;
use crate::transport::{Connector, Transport};
use crate::Error;

/// One recorded wire action, tagged with the host it happened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Connect(String),
    Send(String),
    Read(String),
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Vec<Event>>,
    written: Mutex<HashMap<String, Vec<u8>>>,
}

/// Connector handing out scripted transports in order.
///
/// Connecting with nothing scripted fails like a refused connection.
#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Vec<u8>>>>>,
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector::default())
    }

    /// Script one transport for `host`, serving `responses` one per
    /// request written.
    pub(crate) fn script(&self, host: &str, responses: Vec<Vec<u8>>) {
        self.scripts
            .lock()
            .entry(host.to_string())
            .or_default()
            .push_back(responses);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.shared.events.lock().clone()
    }

    /// Everything written to `host` across all its transports.
    pub(crate) fn written(&self, host: &str) -> Vec<u8> {
        self.shared
            .written
            .lock()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn connect_count(&self, host: &str) -> usize {
        self.count(|e| matches!(e, Event::Connect(h) if h == host))
    }

    pub(crate) fn send_count(&self, host: &str) -> usize {
        self.count(|e| matches!(e, Event::Send(h) if h == host))
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.shared.events.lock().iter().filter(|e| f(e)).count()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, addr: &HostAddr) -> Result<Box<dyn Transport>, Error> {
        let host = addr.to_string();

        let responses = self
            .scripts
            .lock()
            .get_mut(&host)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused)))?;

        self.shared.events.lock().push(Event::Connect(host.clone()));

        Ok(Box::new(FakeTransport {
            host,
            responses: responses.into(),
            readable: VecDeque::new(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[derive(Debug)]
struct FakeTransport {
    host: String,
    responses: VecDeque<Vec<u8>>,
    readable: VecDeque<u8>,
    shared: Arc<Shared>,
}

impl Write for FakeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared
            .events
            .lock()
            .push(Event::Send(self.host.clone()));
        self.shared
            .written
            .lock()
            .entry(self.host.clone())
            .or_default()
            .extend_from_slice(buf);

        // Each request unlocks the next canned response.
        if let Some(response) = self.responses.pop_front() {
            self.readable.extend(response);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared
            .events
            .lock()
            .push(Event::Read(self.host.clone()));

        let n = buf.len().min(self.readable.len());
        for slot in buf.iter_mut().take(n) {
            // Checked by the min above.
            *slot = self.readable.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

/// `HTTP/1.1 <status>` response with a json body and content-length.
pub(crate) fn http_json(status: u16, body: &str) -> Vec<u8> {
    http_response(
        status,
        default_reason(status),
        &[("content-type", "application/json")],
        body.as_bytes(),
    )
}

/// Raw response bytes from parts. A `content-length` header is added
/// unless the caller supplied one.
pub(crate) fn http_response(
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = write!(out, "HTTP/1.1 {} {}\r\n", status, reason);

    let mut has_length = false;
    for (name, value) in headers {
        let _ = write!(out, "{}: {}\r\n", name, value);
        has_length |= name.eq_ignore_ascii_case("content-length");
    }
    if !has_length {
        let _ = write!(out, "content-length: {}\r\n", body.len());
    }

    let _ = write!(out, "\r\n");
    out.extend_from_slice(body);
    out
}

fn default_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        _ => "",
    }
}
