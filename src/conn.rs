use std::io::{self, Write};
use std::sync::Arc;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use log::{debug, warn};
use serde_json::Value;

use crate::host::HostAddr;
use crate::response::{Response, CONTENT_TYPE_JSON};
use crate::transport::{Connector, TcpConnector, Transport};
use crate::{Error, MAX_RESPONSE_HEADERS};

/// Persistent connection to one host which handles json exchanges.
///
/// The transport opens lazily on the first [`send()`][Connection::send]
/// and re-opens after [`close()`][Connection::close]. At most one request
/// is in flight at a time; a connection has exactly one owner at any
/// instant (an in-flight caller, or a [`Pool`][crate::Pool] while idle).
#[derive(Debug)]
pub struct Connection {
    addr: HostAddr,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    /// Bytes read from the transport but not yet consumed.
    buffer: Vec<u8>,
}

/// Parsed response head, before the body is read.
struct Head {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
}

/// How the remaining response body is delimited.
#[derive(Debug, Clone, Copy)]
enum BodyFraming {
    Length(u64),
    Chunked,
    CloseDelimited,
}

impl Connection {
    /// New connection using the given connector. No I/O happens yet.
    pub fn new(addr: HostAddr, connector: Arc<dyn Connector>) -> Connection {
        Connection {
            addr,
            connector,
            transport: None,
            buffer: Vec::new(),
        }
    }

    /// New plain-TCP connection.
    pub fn tcp(addr: HostAddr) -> Connection {
        Connection::new(addr, Arc::new(TcpConnector))
    }

    /// The host this connection is bound to.
    pub fn addr(&self) -> &HostAddr {
        &self.addr
    }

    /// Whether a transport is currently open.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Drop the transport. The next send reconnects.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("closed transport to {}", self.addr);
        }
        self.buffer.clear();
    }

    // ////////////////////////////////////////////////////////////////////////////// SEND

    /// Send a request after handling body and headers.
    ///
    /// A json body sets matching `content-length`/`content-type` headers;
    /// compressed transfer is always requested. The request head and body
    /// are written as a single transport write followed by a flush.
    pub fn send(&mut self, method: &Method, path: &str, body: Option<&Value>) -> Result<(), Error> {
        self.send_request(method, path, body, true)
    }

    fn send_request(
        &mut self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        accept_gzip: bool,
    ) -> Result<(), Error> {
        let payload = match body {
            Some(v) => Some(serde_json::to_vec(v).map_err(|e| Error::BodyNotJson(e.to_string()))?),
            None => None,
        };

        let mut output = Vec::with_capacity(256 + payload.as_ref().map_or(0, Vec::len));
        write!(output, "{} {} HTTP/1.1\r\n", method, path)?;
        write!(output, "host: {}\r\n", self.addr.authority())?;
        if accept_gzip {
            write!(output, "accept-encoding: gzip\r\n")?;
        } else {
            write!(output, "accept-encoding: identity\r\n")?;
        }
        match &payload {
            Some(p) => {
                write!(output, "content-length: {}\r\n", p.len())?;
                write!(output, "content-type: {}\r\n", CONTENT_TYPE_JSON)?;
            }
            None => write!(output, "content-length: 0\r\n")?,
        }
        write!(output, "\r\n")?;
        if let Some(p) = &payload {
            output.extend_from_slice(p);
        }

        debug!(
            "{} {} to {} ({} bytes)",
            method,
            path,
            self.addr,
            output.len()
        );

        let transport = self.transport()?;
        transport.write_all(&output)?;
        transport.flush()?;

        Ok(())
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, Error> {
        if self.transport.is_none() {
            self.buffer.clear();
            let transport = self.connector.connect(&self.addr)?;
            self.transport = Some(transport);
        }

        match &mut self.transport {
            Some(t) => Ok(t),
            // Just set above.
            None => unreachable!(),
        }
    }

    // ////////////////////////////////////////////////////////////////////////////// RECEIVE

    /// Block until a response is available and finalize it.
    ///
    /// A malformed head is an [`Error::HttpParseFail`], a transport that
    /// closes mid-response an [`Error::UnexpectedEof`].
    pub fn receive(&mut self) -> Result<Response, Error> {
        let head = self.receive_head()?;
        let framing = body_framing(head.status, &head.headers)?;

        let mut body = Vec::new();
        self.read_body(framing, &mut body)?;
        self.finish_exchange(framing, &head.headers);

        Response::finalize(head.status, head.reason, head.headers, body)
    }

    /// Receive while streaming the body into `sink` as it arrives,
    /// rather than buffering it on the response.
    pub(crate) fn receive_streaming(
        &mut self,
        sink: &mut dyn io::Write,
    ) -> Result<Response, Error> {
        let head = self.receive_head()?;
        let framing = body_framing(head.status, &head.headers)?;

        self.read_body(framing, sink)?;
        self.finish_exchange(framing, &head.headers);

        Response::finalize(head.status, head.reason, head.headers, Vec::new())
    }

    fn receive_head(&mut self) -> Result<Head, Error> {
        loop {
            if let Some((head, head_len)) = parse_head(&self.buffer)? {
                self.buffer.drain(..head_len);
                debug!("{} {} from {}", head.status, head.reason, self.addr);
                return Ok(head);
            }

            if self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    /// Read from the transport, appending to the staging buffer.
    /// Returns 0 on EOF.
    fn fill(&mut self) -> Result<usize, Error> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::UnexpectedEof);
        };

        let mut chunk = [0u8; 8192];
        let n = transport.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn read_body(&mut self, framing: BodyFraming, sink: &mut dyn io::Write) -> Result<(), Error> {
        match framing {
            BodyFraming::Length(n) => self.copy_exact(n, sink),
            BodyFraming::CloseDelimited => {
                loop {
                    sink.write_all(&self.buffer)?;
                    self.buffer.clear();
                    if self.fill()? == 0 {
                        return Ok(());
                    }
                }
            }
            BodyFraming::Chunked => self.read_chunked(sink),
        }
    }

    fn copy_exact(&mut self, len: u64, sink: &mut dyn io::Write) -> Result<(), Error> {
        let mut remaining = len;
        while remaining > 0 {
            if self.buffer.is_empty() && self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
            let take = (self.buffer.len() as u64).min(remaining) as usize;
            sink.write_all(&self.buffer[..take])?;
            self.buffer.drain(..take);
            remaining -= take as u64;
        }
        Ok(())
    }

    fn read_chunked(&mut self, sink: &mut dyn io::Write) -> Result<(), Error> {
        loop {
            let line = self.read_line()?;
            let len = parse_chunk_len(&line)?;

            if len == 0 {
                // Consume trailers up to the final blank line.
                loop {
                    if self.read_line()?.is_empty() {
                        return Ok(());
                    }
                }
            }

            self.copy_exact(len, sink)?;

            if !self.read_line()?.is_empty() {
                return Err(Error::ChunkExpectedCrLf);
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }

            if self.fill()? == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    /// A close-delimited body or a `connection: close` means the channel
    /// cannot carry another exchange. Dropping the transport here makes a
    /// pooled reuse transparently reconnect.
    fn finish_exchange(&mut self, framing: BodyFraming, headers: &HeaderMap) {
        let close = matches!(framing, BodyFraming::CloseDelimited)
            || headers
                .get(header::CONNECTION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);

        if close {
            self.close();
        }
    }

    // ////////////////////////////////////////////////////////////////////////////// CALL

    /// Send a request and return the decoded response value.
    ///
    /// `params` are urlencoded onto the path. While the status is a
    /// redirection and `max_redirects` remain, the `location` path is
    /// followed on this same host; a location naming a different host is
    /// an [`Error::RedirectHostMismatch`]. With the budget at zero the
    /// redirect response is returned as-is.
    pub fn call(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        params: &[(&str, &str)],
        max_redirects: usize,
    ) -> Result<Value, Error> {
        let mut path = with_params(path, params);
        let mut redirects = max_redirects;

        loop {
            self.send(&method, &path, body)?;
            let response = self.receive()?;

            if redirects > 0 && is_redirect(response.status()) {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .ok_or(Error::NoLocationHeader)?;
                let target = redirect_path(&self.addr, location)?;

                warn!("{}: redirected to {}", response.reason(), target);

                path = with_params(&target, params);
                redirects -= 1;
                continue;
            }

            return response.decoded();
        }
    }

    /// Download a response body from a GET request into `sink`.
    ///
    /// The body is streamed as it is received instead of buffered, and
    /// identity encoding is requested so the sink sees the bytes as
    /// stored.
    pub fn download(&mut self, path: &str, sink: &mut dyn io::Write) -> Result<Value, Error> {
        self.send_request(&Method::GET, path, None, false)?;
        let response = self.receive_streaming(sink)?;
        response.decoded()
    }

    /// Pipeline requests and return their completed responses in order.
    ///
    /// Every request is sent before any response is received.
    pub fn multicall(
        &mut self,
        requests: &[(Method, &str, Option<&Value>)],
    ) -> Result<Vec<Response>, Error> {
        for (method, path, body) in requests {
            self.send(method, path, *body)?;
        }
        requests.iter().map(|_| self.receive()).collect()
    }

    // ////////////////////////////////////////////////////////////////////////////// VERBS

    /// Decoded response value from a GET request.
    pub fn get(&mut self, path: &str, params: &[(&str, &str)]) -> Result<Value, Error> {
        self.call(Method::GET, path, None, params, 0)
    }

    /// Decoded response value from a POST request.
    pub fn post(&mut self, path: &str, body: Option<&Value>) -> Result<Value, Error> {
        self.call(Method::POST, path, body, &[], 0)
    }

    /// Decoded response value from a PUT request.
    pub fn put(&mut self, path: &str, body: Option<&Value>) -> Result<Value, Error> {
        self.call(Method::PUT, path, body, &[], 0)
    }

    /// Decoded response value from a DELETE request.
    pub fn delete(&mut self, path: &str, params: &[(&str, &str)]) -> Result<Value, Error> {
        self.call(Method::DELETE, path, None, params, 0)
    }

    /// Decoded response value from a PATCH request.
    pub fn patch(&mut self, path: &str, body: Option<&Value>) -> Result<Value, Error> {
        self.call(Method::PATCH, path, body, &[], 0)
    }
}

fn parse_head(input: &[u8]) -> Result<Option<(Head, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let head_len = match response.parse(input) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Error::HttpParseTooManyHeaders),
        Err(e) => return Err(e.into()),
    };

    let status = response
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| Error::HttpParseFail("bad status code".to_string()))?;
    let reason = response.reason.unwrap_or_default().to_string();

    let mut map = HeaderMap::new();
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::HttpParseFail(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| Error::HttpParseFail(e.to_string()))?;
        map.append(name, value);
    }

    let head = Head {
        status,
        reason,
        headers: map,
    };

    Ok(Some((head, head_len)))
}

fn body_framing(status: StatusCode, headers: &HeaderMap) -> Result<BodyFraming, Error> {
    // 1xx, 204 and 304 never carry a body.
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Length(0));
    }

    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    if let Some(v) = headers.get(header::CONTENT_LENGTH) {
        let len = v
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::HttpParseFail("bad content-length".to_string()))?;
        return Ok(BodyFraming::Length(len));
    }

    Ok(BodyFraming::CloseDelimited)
}

fn parse_chunk_len(line: &[u8]) -> Result<u64, Error> {
    if !line.is_ascii() {
        return Err(Error::ChunkLenNotAscii);
    }
    let text = std::str::from_utf8(line).map_err(|_| Error::ChunkLenNotAscii)?;

    // Chunk extensions after ';' are ignored.
    let digits = text.split(';').next().unwrap_or(text).trim();

    u64::from_str_radix(digits, 16).map_err(|_| Error::ChunkLenNotANumber)
}

fn is_redirect(status: StatusCode) -> bool {
    // 304 and up are redirection codes without a location header and are
    // not followed.
    status.is_redirection() && status < StatusCode::NOT_MODIFIED
}

/// Resolve a `location` header against the connection's host.
///
/// A location without an authority is taken as same-host. One naming
/// another host is refused; the port is deliberately not compared.
fn redirect_path(addr: &HostAddr, location: &HeaderValue) -> Result<String, Error> {
    let text = location
        .to_str()
        .map_err(|e| Error::BadLocationHeader(e.to_string()))?;
    let uri: Uri = text
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::BadLocationHeader(e.to_string()))?;

    if let Some(host) = uri.host() {
        if host != addr.host() {
            return Err(Error::RedirectHostMismatch(
                addr.host().to_string(),
                host.to_string(),
            ));
        }
    }

    Ok(uri.path().to_string())
}

fn with_params(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }

    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();

    format!("{}?{}", path, query.join("&"))
}
