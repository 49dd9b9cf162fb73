//! Origin-facing TLS: a fresh connection to the real server for each
//! intercepted flow. The library negotiates whatever the origin offers;
//! validation is disabled by the intercept policy.

use std::net::IpAddr;
use std::str::FromStr;

use rustls_pki_types::{DnsName, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::TlsError;

/// SNI for the origin hello: IP literals go as IP server names, anything
/// else as a DNS name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
	match IpAddr::from_str(host) {
		Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
		Err(_) => DnsName::try_from(host.to_string())
			.map(ServerName::DnsName)
			.map_err(|_| TlsError::Handshake(format!("invalid server name {host:?}"))),
	}
}

pub async fn handshake(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, TlsError> {
	let name = server_name(host)?;
	debug!(host, "connecting upstream tls");
	let stream = TlsConnector::from(super::MITM_UPSTREAM.clone())
		.connect(name, tcp)
		.await
		.map_err(|e| TlsError::Handshake(e.to_string()))?;
	Ok(stream)
}
