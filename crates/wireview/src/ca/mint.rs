use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::CertAuthority;
use super::der;

/// Leaf keys are always RSA of this size; the client-facing stack only
/// negotiates TLS 1.2 RSA suites against minted identities.
const LEAF_KEY_BITS: usize = 2048;

/// Cache bound. On overflow the oldest half is dropped in bulk.
const CACHE_CAPACITY: usize = 1000;

// sha256WithRSAEncryption / rsaEncryption / id-ce / id-kp-serverAuth
const OID_SHA256_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
const OID_SERVER_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 1];

#[derive(thiserror::Error, Debug)]
pub enum MintError {
	#[error("leaf key generation failed: {0}")]
	KeyGeneration(String),

	#[error("leaf key encoding failed: {0}")]
	KeyEncoding(String),

	#[error("signing failed: {0}")]
	Signing(String),
}

/// A freshly minted (or cached) per-hostname identity, ready to back a
/// client-facing TLS server.
pub struct MintedIdentity {
	pub hostname: String,
	/// Leaf first, then the CA certificate.
	pub chain: Vec<CertificateDer<'static>>,
	key_pkcs8: PrivatePkcs8KeyDer<'static>,
}

impl MintedIdentity {
	pub fn leaf_der(&self) -> &CertificateDer<'static> {
		&self.chain[0]
	}

	pub fn key_der(&self) -> PrivatePkcs8KeyDer<'static> {
		self.key_pkcs8.clone_key()
	}
}

/// Source of leaf private keys. Production generates a fresh RSA-2048 key
/// per mint; tests substitute a fixed key to keep minting cheap.
pub trait LeafKeyProvider: Send + Sync {
	fn leaf_key(&self) -> Result<RsaPrivateKey, MintError>;
}

pub struct GeneratedRsaKeys;

impl LeafKeyProvider for GeneratedRsaKeys {
	fn leaf_key(&self) -> Result<RsaPrivateKey, MintError> {
		let mut rng = rand::thread_rng();
		RsaPrivateKey::new(&mut rng, LEAF_KEY_BITS).map_err(|e| MintError::KeyGeneration(e.to_string()))
	}
}

/// Mints leaf certificates chained to the loaded CA, caching by hostname.
pub struct CertMinter {
	ca: Arc<CertAuthority>,
	keys: Arc<dyn LeafKeyProvider>,
	cache: Mutex<IndexMap<String, Arc<MintedIdentity>>>,
}

impl CertMinter {
	pub fn new(ca: Arc<CertAuthority>) -> Self {
		Self::with_key_provider(ca, Arc::new(GeneratedRsaKeys))
	}

	pub fn with_key_provider(ca: Arc<CertAuthority>, keys: Arc<dyn LeafKeyProvider>) -> Self {
		Self {
			ca,
			keys,
			cache: Mutex::new(IndexMap::new()),
		}
	}

	/// Look up or mint the identity for `hostname`. Minting happens outside
	/// the cache lock; a concurrent mint for the same hostname is resolved
	/// by re-checking under the lock and keeping the first insertion.
	pub fn identity_for(&self, hostname: &str) -> Result<Arc<MintedIdentity>, MintError> {
		if let Some(found) = self.cache.lock().get(hostname) {
			return Ok(found.clone());
		}

		let minted = Arc::new(self.mint(hostname)?);

		let mut cache = self.cache.lock();
		if let Some(found) = cache.get(hostname) {
			return Ok(found.clone());
		}
		if cache.len() >= CACHE_CAPACITY {
			let keep_from = cache.len() / 2;
			let kept = cache.split_off(keep_from);
			*cache = kept;
			debug!(len = cache.len(), "certificate cache evicted oldest half");
		}
		cache.insert(hostname.to_string(), minted.clone());
		Ok(minted)
	}

	pub fn cached_len(&self) -> usize {
		self.cache.lock().len()
	}

	pub fn is_cached(&self, hostname: &str) -> bool {
		self.cache.lock().contains_key(hostname)
	}

	fn mint(&self, hostname: &str) -> Result<MintedIdentity, MintError> {
		let key = self.keys.leaf_key()?;
		let leaf_der = build_leaf(&self.ca, hostname, &key)?;
		let key_pkcs8 = key
			.to_pkcs8_der()
			.map_err(|e| MintError::KeyEncoding(e.to_string()))?;

		debug!(hostname, "minted leaf certificate");
		Ok(MintedIdentity {
			hostname: hostname.to_string(),
			chain: vec![
				CertificateDer::from(leaf_der),
				CertificateDer::from(self.ca.certificate_der().to_vec()),
			],
			key_pkcs8: PrivatePkcs8KeyDer::from(key_pkcs8.as_bytes().to_vec()),
		})
	}
}

/// Build and sign the leaf certificate DER for `hostname`.
fn build_leaf(
	ca: &CertAuthority,
	hostname: &str,
	leaf_key: &RsaPrivateKey,
) -> Result<Vec<u8>, MintError> {
	let sig_alg = der::sequence(&[&der::oid(OID_SHA256_RSA), &der::null()]);

	// Explicit v3 version tag.
	let version = der::explicit(0, &der::integer(&[2]));

	// 128-bit random serial, top bit cleared so the INTEGER stays positive.
	let mut serial = [0u8; 16];
	rand::Rng::fill(&mut rand::thread_rng(), &mut serial);
	serial[0] &= 0x7f;
	let serial = der::integer(&serial);

	let now = Utc::now();
	let validity = der::sequence(&[
		&der::utc_time(now - Duration::days(2)),
		&der::utc_time(now + Duration::days(365)),
	]);

	let subject = dn_common_name(hostname);

	let public_key_der = leaf_key
		.to_public_key()
		.to_pkcs1_der()
		.map_err(|e| MintError::KeyEncoding(e.to_string()))?;
	let spki = der::sequence(&[
		&der::sequence(&[&der::oid(OID_RSA_ENCRYPTION), &der::null()]),
		&der::bit_string(public_key_der.as_bytes()),
	]);

	let extensions = der::explicit(
		3,
		&der::sequence(&[
			// BasicConstraints, critical: not a CA. An empty SEQUENCE encodes
			// the cA=false default.
			&extension(OID_BASIC_CONSTRAINTS, true, &der::sequence(&[])),
			// KeyUsage, critical: digitalSignature | keyEncipherment. Named
			// bit list with five trailing unused bits.
			&extension(OID_KEY_USAGE, true, &der::tlv(der::TAG_BIT_STRING, &[0x05, 0xa0])),
			&extension(
				OID_EXT_KEY_USAGE,
				false,
				&der::sequence(&[&der::oid(OID_SERVER_AUTH)]),
			),
			&extension(OID_SUBJECT_ALT_NAME, false, &subject_alt_name(hostname)),
		]),
	);

	let tbs = der::sequence(&[
		&version, &serial, &sig_alg, ca.issuer_dn_der(), &validity, &subject, &spki, &extensions,
	]);

	let digest = Sha256::digest(&tbs);
	let signature = ca
		.private_key()
		.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
		.map_err(|e| MintError::Signing(e.to_string()))?;

	Ok(der::sequence(&[
		&tbs,
		&sig_alg,
		&der::bit_string(&signature),
	]))
}

fn dn_common_name(name: &str) -> Vec<u8> {
	der::sequence(&[&der::set(&[&der::sequence(&[
		&der::oid(OID_COMMON_NAME),
		&der::utf8_string(name),
	])])])
}

fn extension(oid_arcs: &[u64], critical: bool, value: &[u8]) -> Vec<u8> {
	if critical {
		der::sequence(&[
			&der::oid(oid_arcs),
			&der::boolean(true),
			&der::octet_string(value),
		])
	} else {
		der::sequence(&[&der::oid(oid_arcs), &der::octet_string(value)])
	}
}

/// SAN carrying a single name: iPAddress for IPv4/IPv6 literals, dNSName
/// otherwise.
fn subject_alt_name(hostname: &str) -> Vec<u8> {
	let general_name = match IpAddr::from_str(hostname) {
		Ok(IpAddr::V4(v4)) => der::implicit(7, &v4.octets()),
		Ok(IpAddr::V6(v6)) => der::implicit(7, &v6.octets()),
		Err(_) => der::implicit(2, hostname.as_bytes()),
	};
	der::sequence(&[&general_name])
}

#[cfg(test)]
#[path = "mint_tests.rs"]
mod tests;
