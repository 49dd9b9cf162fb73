use x509_parser::prelude::*;

use super::*;

const CA_CERT: &str = include_str!("../../tests/common/testdata/ca-cert.pem");
const CA_KEY: &str = include_str!("../../tests/common/testdata/ca-key.pem");

#[test]
fn loads_pem_keypair() {
	let ca = CertAuthority::from_pem(CA_CERT, CA_KEY).unwrap();
	assert!(!ca.certificate_der().is_empty());
	assert!(!ca.issuer_dn_der().is_empty());
}

#[test]
fn extracted_dn_reparses_to_same_name() {
	let ca = CertAuthority::from_pem(CA_CERT, CA_KEY).unwrap();

	let (_, name) = X509Name::from_der(ca.issuer_dn_der()).unwrap();
	let cn = name
		.iter_common_name()
		.next()
		.and_then(|a| a.as_str().ok())
		.unwrap();
	assert_eq!(cn, "Wireview Test Root CA");

	// The slice must match the issuer bytes inside the certificate itself.
	let (_, cert) = X509Certificate::from_der(ca.certificate_der()).unwrap();
	assert_eq!(cert.issuer().as_raw(), ca.issuer_dn_der());
}

#[test]
fn extracts_dn_from_independent_ca() {
	// A CA built by a different library entirely.
	let key = rcgen::KeyPair::generate().unwrap();
	let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
	params
		.distinguished_name
		.push(rcgen::DnType::CommonName, "Synthetic Root");
	params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
	let cert = params.self_signed(&key).unwrap();

	let dn = extract_issuer_dn(cert.der()).unwrap();
	let (_, name) = X509Name::from_der(&dn).unwrap();
	let cn = name
		.iter_common_name()
		.next()
		.and_then(|a| a.as_str().ok())
		.unwrap();
	assert_eq!(cn, "Synthetic Root");
}

#[test]
fn rejects_malformed_certificates() {
	assert!(extract_issuer_dn(&[]).is_err());
	assert!(extract_issuer_dn(&[0x30, 0x03, 0x02, 0x01, 0x01]).is_err());
	// An OCTET STRING where a certificate should be.
	let bogus = der::octet_string(&[1, 2, 3]);
	assert!(extract_issuer_dn(&bogus).is_err());
}

#[test]
fn missing_key_material_is_reported() {
	assert!(matches!(
		CertAuthority::from_pem("", CA_KEY),
		Err(CaError::MissingCert)
	));
	assert!(matches!(
		CertAuthority::from_pem(CA_CERT, ""),
		Err(CaError::MissingKey)
	));
}
