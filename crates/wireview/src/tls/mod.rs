pub mod insecure;
pub mod session;
pub mod upstream;

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::PrivateKeyDer;

use crate::ca::MintedIdentity;
use crate::transport::FlowError;

pub static PROVIDER: Lazy<Arc<CryptoProvider>> =
	Lazy::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

pub fn provider() -> Arc<CryptoProvider> {
	PROVIDER.clone()
}

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("tls configuration rejected: {0}")]
	Config(#[from] rustls::Error),

	#[error("handshake failed: {0}")]
	Handshake(String),

	#[error("handshake timed out")]
	HandshakeTimeout,

	#[error("tls protocol error: {0}")]
	Protocol(String),

	#[error("read failed: {0}")]
	Read(String),

	#[error("write failed: {0}")]
	Write(String),

	#[error("write made no progress")]
	WriteStalled,

	#[error("write timed out")]
	WriteTimeout,

	#[error("session closed")]
	Closed,

	#[error(transparent)]
	Flow(#[from] FlowError),
}

/// Server config for a minted identity. The client-facing side is pinned
/// to TLS 1.2: the session bridges a record machine over an arbitrary byte
/// flow, and 1.2 keeps the client handshake deterministic for that
/// arrangement. No ALPN is offered back to clients.
pub fn mitm_server_config(identity: &MintedIdentity) -> Result<Arc<ServerConfig>, TlsError> {
	let config = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(&[&rustls::version::TLS12])?
		.with_no_client_auth()
		.with_single_cert(identity.chain.clone(), PrivateKeyDer::Pkcs8(identity.key_der()))?;
	Ok(Arc::new(config))
}

/// Client config for the origin-facing leg of an intercepted connection.
/// Certificate validation is disabled: the user opted into interception,
/// and the minted client-facing identity already replaced any notion of
/// origin identity. No ALPN is offered so origins settle on HTTP/1.1,
/// which is what the relay parses.
pub static MITM_UPSTREAM: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
	let mut config = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.expect("default protocol versions are valid")
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
		.with_no_client_auth();
	config.alpn_protocols = Vec::new();
	Arc::new(config)
});

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;
