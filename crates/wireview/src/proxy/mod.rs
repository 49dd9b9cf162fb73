pub mod httprelay;
pub mod mitm;
pub mod passthrough;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::net::runtime::TokioRuntimeProvider;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, event, warn};

use crate::capture::{CaptureStore, FlowKind};
use crate::ca::CertMinter;
use crate::dns::doh::DnsTransport;
use crate::dns::relay as dns_relay;
use crate::http::ParseError;
use crate::proxy::httprelay::{FlowSink, FlowSource, HttpRelayContext, IoSink, IoSource, run_relay};
use crate::tls::TlsError;
use crate::transport::{FlowError, HostPort, TcpFlow, UdpFlow};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("dns resolution failed for {0}")]
	DnsResolution(String),

	#[error("connect timed out")]
	ConnectTimeout,

	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Flow(#[from] FlowError),

	#[error(transparent)]
	Tls(#[from] TlsError),

	#[error(transparent)]
	Framing(#[from] ParseError),

	#[error("message buffer overflow")]
	BufferOverflow,
}

#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
	/// Upstream connection establishment.
	pub connect: Duration,
	/// No bytes moved in either direction.
	pub idle: Duration,
	/// Hard ceiling on a relay's lifetime.
	pub max_lifetime: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			connect: Duration::from_secs(15),
			idle: Duration::from_secs(60),
			max_lifetime: Duration::from_secs(300),
		}
	}
}

/// Tracks when a relay last moved bytes, for the idle deadline.
pub(crate) struct ActivityTracker {
	start: Instant,
	last_ms: AtomicU64,
}

impl ActivityTracker {
	pub(crate) fn new() -> Self {
		Self {
			start: Instant::now(),
			last_ms: AtomicU64::new(0),
		}
	}

	pub(crate) fn touch(&self) {
		self
			.last_ms
			.store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
	}

	fn idle_for(&self) -> Duration {
		let elapsed = self.start.elapsed().as_millis() as u64;
		Duration::from_millis(elapsed.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
	}

	fn age(&self) -> Duration {
		self.start.elapsed()
	}
}

/// Completes when the relay has been idle too long or has outlived its
/// ceiling; the relay group treats that as a teardown trigger.
pub(crate) async fn deadline_guard(activity: &ActivityTracker, timeouts: &Timeouts) -> &'static str {
	loop {
		tokio::time::sleep(Duration::from_secs(1)).await;
		if activity.age() >= timeouts.max_lifetime {
			return "max-lifetime";
		}
		if activity.idle_for() >= timeouts.idle {
			return "idle";
		}
	}
}

/// Opens upstream TCP connections. Production resolves through hickory;
/// tests substitute a dialer that pins everything to a local listener.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
	async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProxyError>;
}

pub struct ResolvingDialer {
	resolver: TokioResolver,
}

impl ResolvingDialer {
	/// System resolver configuration when available, public defaults
	/// otherwise.
	pub fn new() -> Self {
		let resolver = match TokioResolver::builder_tokio() {
			Ok(builder) => builder,
			Err(e) => {
				warn!(error = %e, "system resolver config unavailable, using defaults");
				TokioResolver::builder_with_config(ResolverConfig::default(), TokioRuntimeProvider::default())
			},
		}
		.build()
		.expect("resolver builder produces a valid resolver");
		Self { resolver }
	}
}

impl Default for ResolvingDialer {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Dialer for ResolvingDialer {
	async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProxyError> {
		let addr = match IpAddr::from_str(host) {
			Ok(ip) => SocketAddr::new(ip, port),
			Err(_) => {
				let ip = self
					.resolver
					.lookup_ip(host)
					.await
					.map_err(|e| ProxyError::DnsResolution(format!("{host}: {e}")))?
					.iter()
					.next()
					.ok_or_else(|| ProxyError::DnsResolution(host.to_string()))?;
				SocketAddr::new(ip, port)
			},
		};
		let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ProxyError::ConnectTimeout)??;
		stream.set_nodelay(true)?;
		Ok(stream)
	}
}

/// Owns dispatch for every claimed flow: route by port, run the chosen
/// relay to completion, release the handle. Relays never surface errors
/// here; anything that goes wrong is logged and recorded on the capture
/// side.
pub struct FlowRouter {
	pub(crate) store: Arc<CaptureStore>,
	pub(crate) minter: Option<Arc<CertMinter>>,
	pub(crate) dns: Arc<dyn DnsTransport>,
	pub(crate) dialer: Arc<dyn Dialer>,
	pub(crate) timeouts: Timeouts,
}

impl FlowRouter {
	pub fn new(
		store: Arc<CaptureStore>,
		minter: Option<Arc<CertMinter>>,
		dns: Arc<dyn DnsTransport>,
		dialer: Arc<dyn Dialer>,
		timeouts: Timeouts,
	) -> Self {
		if minter.is_none() {
			warn!("no CA loaded; https flows fall through to passthrough");
		}
		Self {
			store,
			minter,
			dns,
			dialer,
			timeouts,
		}
	}

	/// Process one claimed TCP flow to completion.
	pub async fn handle_tcp_flow(&self, flow: Arc<dyn TcpFlow>, remote: HostPort, process: &str) {
		if remote.port == 0 {
			warn!(%remote, "rejecting flow with invalid port");
			flow.close_read();
			flow.close_write();
			return;
		}
		debug!(%remote, process, "tcp flow claimed");
		match remote.port {
			443 => mitm::run(self, flow, &remote, process).await,
			80 => self.run_http(flow, &remote, process).await,
			53 => {
				dns_relay::run_tcp_dns(
					flow,
					self.dns.clone(),
					self.store.clone(),
					&remote,
					process,
					&self.timeouts,
				)
				.await
			},
			_ => passthrough::run(self, flow, &remote, process, FlowKind::Tcp).await,
		}
	}

	/// Process one claimed UDP flow to completion.
	pub async fn handle_udp_flow(&self, flow: Arc<dyn UdpFlow>, process: &str) {
		debug!(process, "udp flow claimed");
		dns_relay::run_udp_relay(
			flow,
			self.dns.clone(),
			self.store.clone(),
			process,
			&self.timeouts,
		)
		.await;
	}

	async fn run_http(&self, flow: Arc<dyn TcpFlow>, remote: &HostPort, process: &str) {
		let start = Instant::now();
		let ctx = HttpRelayContext::new(
			self.store.clone(),
			FlowKind::Http,
			&remote.host,
			remote.port,
			process,
		);
		let origin = match self
			.dialer
			.dial(&remote.host, remote.port, self.timeouts.connect)
			.await
		{
			Ok(stream) => stream,
			Err(e) => {
				debug!(%remote, error = %e, "http origin connect failed");
				flow.close_read();
				flow.close_write();
				return;
			},
		};
		let (read_half, write_half) = origin.into_split();
		run_relay(
			&ctx,
			FlowSource(flow.clone()),
			FlowSink(flow.clone()),
			IoSource(read_half),
			IoSink(write_half),
			&self.timeouts,
		)
		.await;
		flow.close_read();
		flow.close_write();

		event!(
			target: "flow",
			parent: None,
			tracing::Level::DEBUG,

			remote = %remote,
			process,

			bytes_in = ctx.bytes_in.load(Ordering::Relaxed),
			bytes_out = ctx.bytes_out.load(Ordering::Relaxed),
			duration_ms = start.elapsed().as_millis() as u64,

			"http relay completed"
		);
	}
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
