//! Shared fixtures for unit tests: a pre-generated CA, a fixed leaf key
//! (skips RSA keygen), and a client config trusting that CA.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use tokio::net::TcpStream;

use crate::ca::{CertAuthority, CertMinter, LeafKeyProvider, MintError};
use crate::dns::doh::{DnsAnswer, DnsTransport, DohError};
use crate::proxy::{Dialer, ProxyError};

pub const CA_CERT: &str = include_str!("../tests/common/testdata/ca-cert.pem");
pub const CA_KEY: &str = include_str!("../tests/common/testdata/ca-key.pem");
pub const LEAF_KEY: &str = include_str!("../tests/common/testdata/leaf-key.pem");

pub struct FixedLeafKey;

impl LeafKeyProvider for FixedLeafKey {
	fn leaf_key(&self) -> Result<RsaPrivateKey, MintError> {
		static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
		Ok(
			KEY
				.get_or_init(|| RsaPrivateKey::from_pkcs8_pem(LEAF_KEY).unwrap())
				.clone(),
		)
	}
}

pub fn test_ca() -> Arc<CertAuthority> {
	Arc::new(CertAuthority::from_pem(CA_CERT, CA_KEY).unwrap())
}

pub fn test_minter() -> Arc<CertMinter> {
	Arc::new(CertMinter::with_key_provider(test_ca(), Arc::new(FixedLeafKey)))
}

/// DoH stub: answers every query with fixed bytes, or fails when built
/// with `None`.
pub struct StubDns {
	pub answer: Option<Bytes>,
	pub encrypted: bool,
}

impl StubDns {
	pub fn answering(answer: impl Into<Bytes>) -> Arc<Self> {
		Arc::new(Self {
			answer: Some(answer.into()),
			encrypted: true,
		})
	}

	pub fn unreachable() -> Arc<Self> {
		Arc::new(Self {
			answer: None,
			encrypted: false,
		})
	}
}

#[async_trait::async_trait]
impl DnsTransport for StubDns {
	async fn doh_query(&self, _query: Bytes) -> Result<DnsAnswer, DohError> {
		match &self.answer {
			Some(message) => Ok(DnsAnswer {
				message: message.clone(),
				encrypted: self.encrypted,
			}),
			None => Err(DohError::Unreachable),
		}
	}
}

/// Dialer pinned to one local listener, ignoring the requested host.
pub struct LocalDialer(pub SocketAddr);

#[async_trait::async_trait]
impl Dialer for LocalDialer {
	async fn dial(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<TcpStream, ProxyError> {
		Ok(TcpStream::connect(self.0).await?)
	}
}

/// Client config that trusts the test CA, for driving real TLS clients
/// against minted identities.
pub fn trusting_client_config() -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	let mut reader = std::io::BufReader::new(CA_CERT.as_bytes());
	for cert in rustls_pemfile::certs(&mut reader) {
		roots.add(cert.unwrap()).unwrap();
	}
	let config = rustls::ClientConfig::builder_with_provider(crate::tls::provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.unwrap()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Arc::new(config)
}
