pub mod memory;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;

/// Hard cap on any per-connection reassembly buffer. Appends beyond this are
/// the caller's problem; see `RelayState` and `TlsSession` for their
/// respective policies.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
	#[error("flow i/o: {0}")]
	Io(#[from] std::io::Error),

	#[error("flow closed")]
	Closed,

	#[error("write timed out")]
	WriteTimeout,
}

/// Remote endpoint of a flow, as reported by the interception layer. The
/// host may be a DNS name (when the interceptor resolved the app's intent)
/// or an IP literal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HostPort {
	pub host: String,
	pub port: u16,
}

impl HostPort {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	pub fn ip(&self) -> Option<IpAddr> {
		IpAddr::from_str(&self.host).ok()
	}
}

impl fmt::Display for HostPort {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// One UDP datagram together with the remote endpoint it came from or is
/// destined to.
#[derive(Clone, Debug)]
pub struct Datagram {
	pub payload: Bytes,
	pub endpoint: HostPort,
}

/// A claimed outbound TCP flow. The interception layer owns the underlying
/// OS handle; this trait is the byte-level capability surface the proxy
/// core consumes.
///
/// Reads and writes are independent (the relay runs one pump per
/// direction), so all methods take `&self`; implementations synchronize
/// internally.
#[async_trait::async_trait]
pub trait TcpFlow: Send + Sync + 'static {
	/// Read the next chunk from the application. An empty chunk means EOF.
	async fn read(&self) -> Result<Bytes, FlowError>;

	/// Write bytes back to the application, completing once the
	/// interception layer has accepted them.
	async fn write(&self, data: Bytes) -> Result<(), FlowError>;

	/// Half-close the read side. Idempotent.
	fn close_read(&self);

	/// Half-close the write side. Idempotent.
	fn close_write(&self);
}

/// A claimed outbound UDP flow: a datagram conversation that may span
/// multiple remote endpoints.
#[async_trait::async_trait]
pub trait UdpFlow: Send + Sync + 'static {
	/// Read the next batch of outbound datagrams. An empty batch means the
	/// flow has ended.
	async fn read_datagrams(&self) -> Result<Vec<Datagram>, FlowError>;

	/// Deliver datagrams back to the application, each tagged with the
	/// remote endpoint it originated from.
	async fn write_datagrams(&self, datagrams: Vec<Datagram>) -> Result<(), FlowError>;

	/// Tear the flow down. Idempotent.
	fn close(&self);
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
