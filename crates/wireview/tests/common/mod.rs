//! Shared harness for end-to-end tests: fixture CA material, a fixed leaf
//! key (skips per-test RSA keygen), stub DNS transports, and local TCP/TLS
//! origins.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wireview::ca::{CertAuthority, CertMinter, LeafKeyProvider, MintError};
use wireview::capture::CaptureStore;
use wireview::dns::doh::{DnsAnswer, DnsTransport, DohError};
use wireview::proxy::{Dialer, FlowRouter, ProxyError, Timeouts};

pub const CA_CERT: &str = include_str!("testdata/ca-cert.pem");
pub const CA_KEY: &str = include_str!("testdata/ca-key.pem");
pub const LEAF_KEY: &str = include_str!("testdata/leaf-key.pem");

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

pub fn test_minter() -> Arc<CertMinter> {
	let ca = Arc::new(CertAuthority::from_pem(CA_CERT, CA_KEY).unwrap());
	Arc::new(CertMinter::with_key_provider(ca, Arc::new(FixedLeafKey)))
}

/// Client config trusting the fixture CA.
pub fn trusting_client_config() -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	let mut reader = std::io::BufReader::new(CA_CERT.as_bytes());
	for cert in rustls_pemfile::certs(&mut reader) {
		roots.add(cert.unwrap()).unwrap();
	}
	let config = rustls::ClientConfig::builder_with_provider(wireview::tls::provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.unwrap()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Arc::new(config)
}

pub struct LocalDialer(pub SocketAddr);

#[async_trait::async_trait]
impl Dialer for LocalDialer {
	async fn dial(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<TcpStream, ProxyError> {
		Ok(TcpStream::connect(self.0).await?)
	}
}

pub struct StubDns {
	answer: Option<Bytes>,
	encrypted: bool,
}

impl StubDns {
	pub fn answering(answer: impl Into<Bytes>) -> Arc<Self> {
		Arc::new(Self {
			answer: Some(answer.into()),
			encrypted: true,
		})
	}

	pub fn raw_fallback(answer: impl Into<Bytes>) -> Arc<Self> {
		Arc::new(Self {
			answer: Some(answer.into()),
			encrypted: false,
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

pub struct Routed {
	pub store: Arc<CaptureStore>,
	pub router: Arc<FlowRouter>,
}

/// Router wired to a local origin, with MITM enabled and DNS stubbed.
pub fn routed(origin: SocketAddr, dns: Arc<dyn DnsTransport>) -> Routed {
	let store = Arc::new(CaptureStore::new());
	let router = Arc::new(FlowRouter::new(
		store.clone(),
		Some(test_minter()),
		dns,
		Arc::new(LocalDialer(origin)),
		Timeouts::default(),
	));
	Routed { store, router }
}

/// Plain-TCP origin speaking canned HTTP: reads until the blank line, then
/// writes `response` for every request, `count` times.
pub async fn http_origin(response: &'static [u8], count: usize) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		for _ in 0..count {
			read_request_head(&mut sock).await;
			tokio::time::sleep(Duration::from_millis(5)).await;
			sock.write_all(response).await.unwrap();
		}
	});
	addr
}

/// TLS origin (self-signed, which the interceptor ignores by policy)
/// answering each request with `response`.
pub async fn tls_origin(response: &'static [u8], count: usize) -> SocketAddr {
	let key = rcgen::KeyPair::generate().unwrap();
	let params = rcgen::CertificateParams::new(vec!["origin.test".to_string()]).unwrap();
	let cert = params.self_signed(&key).unwrap();
	let server_config = rustls::ServerConfig::builder_with_provider(wireview::tls::provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(
			vec![cert.der().clone()],
			rustls_pki_types::PrivateKeyDer::Pkcs8(key.serialize_der().into()),
		)
		.unwrap();
	let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (sock, _) = listener.accept().await.unwrap();
		let mut tls = acceptor.accept(sock).await.unwrap();
		for _ in 0..count {
			read_request_head(&mut tls).await;
			tokio::time::sleep(Duration::from_millis(5)).await;
			tls.write_all(response).await.unwrap();
		}
	});
	addr
}

async fn read_request_head<S: tokio::io::AsyncRead + Unpin>(sock: &mut S) {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	while !head.ends_with(b"\r\n\r\n") {
		let n = sock.read(&mut byte).await.unwrap();
		if n == 0 {
			return;
		}
		head.extend_from_slice(&byte);
	}
}
