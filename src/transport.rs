use std::fmt;
use std::io;
use std::net::TcpStream;

use crate::host::HostAddr;
use crate::Error;

/// Byte stream carrying request/response exchanges to one host.
///
/// The transport is treated as a given capability: an opened channel with
/// ordinary blocking read/write semantics. Reads and writes are the only
/// operations in this crate that may block. Dropping the transport closes
/// the channel.
pub trait Transport: io::Read + io::Write + Send + fmt::Debug {}

impl<T> Transport for T where T: io::Read + io::Write + Send + fmt::Debug {}

/// Opens transports to hosts.
///
/// [`Connection`][crate::Connection] opens its transport lazily through a
/// connector, and re-opens it after a close. Implement this to wrap the
/// byte stream (TLS, proxies) or to substitute scripted streams in tests.
pub trait Connector: fmt::Debug + Send + Sync {
    /// Open a new transport to `addr`.
    fn connect(&self, addr: &HostAddr) -> Result<Box<dyn Transport>, Error>;
}

/// Default connector: plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: &HostAddr) -> Result<Box<dyn Transport>, Error> {
        let stream = TcpStream::connect((addr.host(), addr.port()))?;

        // Request heads are small and written in one go.
        stream.set_nodelay(true)?;

        log::debug!("opened tcp transport to {}", addr);

        Ok(Box::new(stream))
    }
}
