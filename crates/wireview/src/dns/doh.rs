//! DNS-over-HTTPS client: RFC 8484 POST of application/dns-message
//! against a configured upstream pair, with a raw-UDP escape hatch when
//! both upstreams are down.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Per-upstream request budget.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget across all encrypted attempts.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for the raw-UDP fallback.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(3);

const FALLBACK_RESOLVER: &str = "8.8.8.8:53";

const CONTENT_TYPE: &str = "application/dns-message";

#[derive(thiserror::Error, Debug)]
pub enum DohError {
	#[error("doh client construction failed: {0}")]
	Client(reqwest::Error),

	#[error("all dns transports failed")]
	Unreachable,
}

/// A wire-format DNS answer, flagged with whether it travelled encrypted.
#[derive(Clone, Debug)]
pub struct DnsAnswer {
	pub message: Bytes,
	pub encrypted: bool,
}

/// Async mapping from a wire-format DNS query to a wire-format response.
/// The relays depend on this trait only; tests stub it.
#[async_trait::async_trait]
pub trait DnsTransport: Send + Sync + 'static {
	async fn doh_query(&self, query: Bytes) -> Result<DnsAnswer, DohError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DohProvider {
	#[default]
	Cloudflare,
	CloudflareFamily,
	Google,
	Quad9,
}

impl DohProvider {
	/// Primary and fallback endpoint for the provider.
	pub fn endpoints(&self) -> [&'static str; 2] {
		match self {
			DohProvider::Cloudflare => [
				"https://1.1.1.1/dns-query",
				"https://1.0.0.1/dns-query",
			],
			DohProvider::CloudflareFamily => [
				"https://1.1.1.3/dns-query",
				"https://1.0.0.3/dns-query",
			],
			DohProvider::Google => [
				"https://8.8.8.8/dns-query",
				"https://8.8.4.4/dns-query",
			],
			DohProvider::Quad9 => [
				"https://9.9.9.9:5053/dns-query",
				"https://149.112.112.112:5053/dns-query",
			],
		}
	}
}

pub struct DohClient {
	http: reqwest::Client,
	endpoints: Vec<String>,
	fallback_resolver: String,
}

impl DohClient {
	pub fn new(provider: DohProvider) -> Result<Self, DohError> {
		Self::with_endpoints(
			provider.endpoints().map(String::from).to_vec(),
			FALLBACK_RESOLVER.to_string(),
		)
	}

	pub fn with_endpoints(
		endpoints: Vec<String>,
		fallback_resolver: String,
	) -> Result<Self, DohError> {
		let http = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.map_err(DohError::Client)?;
		Ok(Self {
			http,
			endpoints,
			fallback_resolver,
		})
	}

	async fn post(&self, endpoint: &str, query: Bytes) -> Result<Bytes, reqwest::Error> {
		let response = self
			.http
			.post(endpoint)
			.header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
			.header(reqwest::header::ACCEPT, CONTENT_TYPE)
			.body(query)
			.send()
			.await?
			.error_for_status()?;
		response.bytes().await
	}

	/// Primary, then fallback, inside the total encrypted budget.
	async fn encrypted_query(&self, query: &Bytes) -> Option<Bytes> {
		for endpoint in &self.endpoints {
			match self.post(endpoint, query.clone()).await {
				Ok(answer) => return Some(answer),
				Err(e) => debug!(endpoint = %endpoint, error = %e, "doh upstream failed"),
			}
		}
		None
	}
}

#[async_trait::async_trait]
impl DnsTransport for DohClient {
	async fn doh_query(&self, query: Bytes) -> Result<DnsAnswer, DohError> {
		match tokio::time::timeout(TOTAL_TIMEOUT, self.encrypted_query(&query)).await {
			Ok(Some(message)) => {
				return Ok(DnsAnswer {
					message,
					encrypted: true,
				});
			},
			Ok(None) => {},
			Err(_) => debug!("doh total budget exhausted"),
		}

		warn!("doh upstreams unreachable, trying raw dns");
		match tokio::time::timeout(
			FALLBACK_TIMEOUT,
			raw_udp_query(&self.fallback_resolver, &query),
		)
		.await
		{
			Ok(Ok(message)) => Ok(DnsAnswer {
				message,
				encrypted: false,
			}),
			_ => Err(DohError::Unreachable),
		}
	}
}

async fn raw_udp_query(resolver: &str, query: &Bytes) -> std::io::Result<Bytes> {
	let socket = UdpSocket::bind("0.0.0.0:0").await?;
	socket.connect(resolver).await?;
	socket.send(query).await?;
	let mut buf = vec![0u8; 4096];
	let n = socket.recv(&mut buf).await?;
	buf.truncate(n);
	Ok(Bytes::from(buf))
}

#[cfg(test)]
#[path = "doh_tests.rs"]
mod tests;
