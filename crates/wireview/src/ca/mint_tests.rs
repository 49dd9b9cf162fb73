use std::sync::Arc;

use x509_parser::prelude::*;

use super::*;
use crate::ca::der::read_tlv;
use crate::testutil::{FixedLeafKey, test_ca, test_minter};

fn minter() -> Arc<CertMinter> {
	test_minter()
}

fn parse(identity: &MintedIdentity) -> X509Certificate<'_> {
	let (_, cert) = X509Certificate::from_der(identity.leaf_der()).unwrap();
	cert
}

#[test]
fn leaf_carries_hostname_and_issuer() {
	let m = minter();
	let id = m.identity_for("example.com").unwrap();
	let cert = parse(&id);

	let cn = cert
		.subject()
		.iter_common_name()
		.next()
		.and_then(|a| a.as_str().ok())
		.unwrap();
	assert_eq!(cn, "example.com");

	let issuer_cn = cert
		.issuer()
		.iter_common_name()
		.next()
		.and_then(|a| a.as_str().ok())
		.unwrap();
	assert_eq!(issuer_cn, "Wireview Test Root CA");

	// Chain is leaf then CA.
	assert_eq!(id.chain.len(), 2);
}

#[test]
fn san_is_dns_for_hostnames() {
	let m = minter();
	let id = m.identity_for("example.com").unwrap();
	let cert = parse(&id);
	let san = cert.subject_alternative_name().unwrap().unwrap();
	assert!(matches!(
		san.value.general_names.as_slice(),
		[GeneralName::DNSName("example.com")]
	));
}

#[test]
fn san_is_ip_for_v4_literal() {
	let m = minter();
	let id = m.identity_for("10.0.0.1").unwrap();
	let cert = parse(&id);
	let san = cert.subject_alternative_name().unwrap().unwrap();
	assert!(matches!(
		san.value.general_names.as_slice(),
		[GeneralName::IPAddress([10, 0, 0, 1])]
	));
}

#[test]
fn san_is_ip_for_v6_literal() {
	let m = minter();
	let id = m.identity_for("2606:4700::1111").unwrap();
	let cert = parse(&id);
	let san = cert.subject_alternative_name().unwrap().unwrap();
	match san.value.general_names.as_slice() {
		[GeneralName::IPAddress(octets)] => assert_eq!(octets.len(), 16),
		other => panic!("expected one iPAddress, got {other:?}"),
	}
}

#[test]
fn leaf_profile_matches_server_auth() {
	let m = minter();
	let id = m.identity_for("example.com").unwrap();
	let cert = parse(&id);

	assert_eq!(cert.version(), X509Version::V3);

	let bc = cert.basic_constraints().unwrap().unwrap();
	assert!(bc.critical);
	assert!(!bc.value.ca);

	let ku = cert.key_usage().unwrap().unwrap();
	assert!(ku.critical);
	assert!(ku.value.digital_signature());
	assert!(ku.value.key_encipherment());
	assert!(!ku.value.key_cert_sign());

	let eku = cert.extended_key_usage().unwrap().unwrap();
	assert!(eku.value.server_auth);

	// 128-bit positive serial.
	assert!(cert.tbs_certificate.serial.bits() <= 128);
	let raw = cert.raw_serial();
	assert!(raw[0] & 0x80 == 0);
}

#[test]
fn validity_spans_backdate_to_one_year() {
	let m = minter();
	let id = m.identity_for("example.com").unwrap();
	let cert = parse(&id);
	let now = chrono::Utc::now().timestamp();

	let not_before = cert.validity().not_before.timestamp();
	let not_after = cert.validity().not_after.timestamp();
	let two_days = 2 * 86_400;
	let year = 365 * 86_400;

	assert!((now - two_days - not_before).abs() < 120);
	assert!((now + year - not_after).abs() < 120);
}

#[test]
fn signature_verifies_against_ca_key() {
	let ca = test_ca();
	let m = CertMinter::with_key_provider(ca.clone(), Arc::new(FixedLeafKey));
	let id = m.identity_for("example.com").unwrap();

	// Certificate ::= SEQUENCE { tbs, sigAlg, signature BIT STRING }
	let (outer, _) = read_tlv(id.leaf_der()).unwrap();
	let (tbs, rest) = read_tlv(outer.content).unwrap();
	let (_sig_alg, rest) = read_tlv(rest).unwrap();
	let (sig, _) = read_tlv(rest).unwrap();
	let signature = &sig.content[1..]; // skip unused-bits octet

	let digest = sha2::Sha256::digest(tbs.raw);
	ca.private_key()
		.to_public_key()
		.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
		.expect("leaf signature must verify with the CA public key");
}

#[test]
fn identity_is_cached_per_hostname() {
	let m = minter();
	let a = m.identity_for("example.com").unwrap();
	let b = m.identity_for("example.com").unwrap();
	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(m.cached_len(), 1);
}

#[test]
fn cache_evicts_oldest_half_at_capacity() {
	let m = minter();
	for i in 0..1001 {
		m.identity_for(&format!("host{i}.example")).unwrap();
	}
	assert!(m.cached_len() <= 1000);
	// The most recent mint survives; the very first does not.
	assert!(m.is_cached("host1000.example"));
	assert!(!m.is_cached("host0.example"));
}
