pub mod der;
pub mod mint;

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rustls_pki_types::PrivateKeyDer;

pub use mint::{CertMinter, GeneratedRsaKeys, LeafKeyProvider, MintError, MintedIdentity};

use der::{TAG_INTEGER, TAG_SEQUENCE, read_tlv};

#[derive(thiserror::Error, Debug)]
pub enum CaError {
	#[error("no certificate found in PEM input")]
	MissingCert,

	#[error("no private key found in PEM input")]
	MissingKey,

	#[error("failed to read PEM: {0}")]
	Pem(#[from] std::io::Error),

	#[error("failed to decode CA private key: {0}")]
	KeyDecode(String),

	#[error("CA private key is not RSA")]
	KeyNotRsa,

	#[error("malformed CA certificate: {0}")]
	CertStructure(#[from] der::DerError),

	#[error("malformed CA certificate: unexpected field order")]
	CertLayout,
}

/// The root CA identity leaf certificates chain to. The platform
/// trust-store lookup lives with the integrator; it hands the keypair in
/// as PEM or DER. Immutable for the process lifetime; minting snapshots it
/// through an `Arc`.
pub struct CertAuthority {
	cert_der: Vec<u8>,
	issuer_dn: Vec<u8>,
	key: RsaPrivateKey,
}

impl CertAuthority {
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
		let mut cert_reader = std::io::BufReader::new(cert_pem.as_bytes());
		let cert = rustls_pemfile::certs(&mut cert_reader)
			.next()
			.ok_or(CaError::MissingCert)??;

		let mut key_reader = std::io::BufReader::new(key_pem.as_bytes());
		let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(CaError::MissingKey)?;
		let key = decode_rsa_key(&key)?;

		Self::from_der(cert.as_ref().to_vec(), key)
	}

	pub fn from_der(cert_der: Vec<u8>, key: RsaPrivateKey) -> Result<Self, CaError> {
		let issuer_dn = extract_issuer_dn(&cert_der)?;
		Ok(Self {
			cert_der,
			issuer_dn,
			key,
		})
	}

	pub fn certificate_der(&self) -> &[u8] {
		&self.cert_der
	}

	/// The CA's distinguished name as a raw DER SEQUENCE, spliced verbatim
	/// into minted leaves as their issuer.
	pub fn issuer_dn_der(&self) -> &[u8] {
		&self.issuer_dn
	}

	pub(crate) fn private_key(&self) -> &RsaPrivateKey {
		&self.key
	}
}

fn decode_rsa_key(key: &PrivateKeyDer<'_>) -> Result<RsaPrivateKey, CaError> {
	match key {
		PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der())
			.map_err(|e| CaError::KeyDecode(e.to_string())),
		PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
			.map_err(|e| CaError::KeyDecode(e.to_string())),
		_ => Err(CaError::KeyNotRsa),
	}
}

/// Walk a certificate to its issuer DN by fixed structure:
/// Certificate SEQUENCE → TBSCertificate SEQUENCE → optional `[0]` version
/// → serialNumber INTEGER → signature AlgorithmIdentifier SEQUENCE →
/// issuer Name SEQUENCE. Returns the issuer's complete encoding. For a
/// self-signed root this is also its subject.
pub fn extract_issuer_dn(cert_der: &[u8]) -> Result<Vec<u8>, CaError> {
	let (certificate, _) = read_tlv(cert_der)?;
	if certificate.tag != TAG_SEQUENCE {
		return Err(CaError::CertLayout);
	}
	let (tbs, _) = read_tlv(certificate.content)?;
	if tbs.tag != TAG_SEQUENCE {
		return Err(CaError::CertLayout);
	}

	let (first, mut rest) = read_tlv(tbs.content)?;
	// v1 certificates omit the explicit version and open with the serial.
	if first.tag == 0xa0 {
		let (serial, after) = read_tlv(rest)?;
		if serial.tag != TAG_INTEGER {
			return Err(CaError::CertLayout);
		}
		rest = after;
	} else if first.tag != TAG_INTEGER {
		return Err(CaError::CertLayout);
	}

	let (sig_alg, rest) = read_tlv(rest)?;
	if sig_alg.tag != TAG_SEQUENCE {
		return Err(CaError::CertLayout);
	}
	let (issuer, _) = read_tlv(rest)?;
	if issuer.tag != TAG_SEQUENCE {
		return Err(CaError::CertLayout);
	}
	Ok(issuer.raw.to_vec())
}

#[cfg(test)]
#[path = "ca_tests.rs"]
mod tests;
