use rustls_pki_types::ServerName;

use super::*;
use crate::testutil::test_minter;

#[test]
fn server_config_accepts_minted_identity() {
	// with_single_cert cross-checks the leaf against the private key, so
	// this exercises the hand-built SubjectPublicKeyInfo too.
	let identity = test_minter().identity_for("example.com").unwrap();
	let config = mitm_server_config(&identity).unwrap();
	assert!(config.alpn_protocols.is_empty());
}

#[test]
fn upstream_config_is_quiet_on_alpn() {
	assert!(MITM_UPSTREAM.alpn_protocols.is_empty());
}

#[test]
fn upstream_server_name_forms() {
	assert!(matches!(
		upstream::server_name("10.0.0.1").unwrap(),
		ServerName::IpAddress(_)
	));
	assert!(matches!(
		upstream::server_name("example.com").unwrap(),
		ServerName::DnsName(_)
	));
	assert!(upstream::server_name("not a hostname").is_err());
}
