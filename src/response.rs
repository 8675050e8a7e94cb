use std::io::Read;
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use http::{header, HeaderMap, StatusCode};
use serde_json::Value;

use crate::{Error, AGENT};

/// Header carrying the server's advisory elapsed-time metric.
const RESPONSE_TIME: &str = "x-response-time";

/// json media type matched against `content-type`.
pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// A completed response which handles json and caches its body.
///
/// Constructed by [`Connection::receive`][crate::Connection::receive],
/// which reads the remaining transport body, inflates it when the server
/// advertised gzip, and records the advisory elapsed time. The response
/// is immutable from then on: repeated [`decoded()`][Response::decoded]
/// calls return the same value without re-reading anything.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Vec<u8>,
    time: f64,
    decoded: OnceLock<Value>,
}

impl Response {
    /// Finalize an exchange: inflate the body if the content-encoding
    /// advertises compression, and parse the elapsed-time header.
    pub(crate) fn finalize(
        status: StatusCode,
        reason: String,
        headers: HeaderMap,
        raw_body: Vec<u8>,
    ) -> Result<Response, Error> {
        let gzipped = !raw_body.is_empty()
            && header_str(&headers, header::CONTENT_ENCODING).contains("gzip");

        let body = if gzipped {
            let mut inflated = Vec::with_capacity(raw_body.len() * 2);
            GzDecoder::new(&raw_body[..]).read_to_end(&mut inflated)?;
            inflated
        } else {
            raw_body
        };

        // Absence (or garbage) yields NaN, never an error.
        let time = header_str(&headers, RESPONSE_TIME)
            .parse::<f64>()
            .unwrap_or(f64::NAN);

        Ok(Response {
            status,
            reason,
            headers,
            body,
            time,
            decoded: OnceLock::new(),
        })
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase as sent on the wire.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw (inflated) body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Server-side elapsed seconds from the `x-response-time` header.
    ///
    /// NaN when the header is absent.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Whether the status is successful, i.e. in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Return the evaluated response body or raise the remote error.
    ///
    /// A non-empty json body parses into a [`Value`]; an empty body is
    /// `Null`; any other content type is returned as a string of the raw
    /// bytes. A `warning` header naming this library as agent is surfaced
    /// through [`log::warn!`] on the first call. A non-2xx status is an
    /// [`Error::Remote`] carrying the decoded body.
    pub fn decoded(&self) -> Result<Value, Error> {
        let value = match self.decoded.get() {
            Some(v) => v.clone(),
            None => {
                let v = self.evaluate()?;
                self.surface_warning();
                self.decoded.get_or_init(|| v).clone()
            }
        };

        if self.is_success() {
            Ok(value)
        } else {
            Err(Error::Remote(self.status, self.reason.clone(), value))
        }
    }

    fn evaluate(&self) -> Result<Value, Error> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }

        if header_str(&self.headers, header::CONTENT_TYPE).starts_with(CONTENT_TYPE_JSON) {
            serde_json::from_slice(&self.body).map_err(|e| Error::BodyNotJson(e.to_string()))
        } else {
            Ok(Value::String(
                String::from_utf8_lossy(&self.body).into_owned(),
            ))
        }
    }

    /// Advisory warning channel: `<code> <agent> <quoted-text>`, consumed
    /// only when the agent identifies this library.
    fn surface_warning(&self) {
        let warning = header_str(&self.headers, header::WARNING);

        let mut parts = warning.splitn(3, ' ');
        let _code = parts.next().unwrap_or_default();
        let agent = parts.next().unwrap_or_default();
        let text = parts.next().unwrap_or_default();

        if agent != AGENT {
            return;
        }

        // The text is a quoted json string. Fall back to the raw header
        // text if the server quoted it some other way.
        let message = serde_json::from_str::<String>(text).unwrap_or_else(|_| text.to_string());
        log::warn!("{}", message);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
