//! ASN.1/DER primitives for certificate construction. Encoders are pure
//! functions over byte slices; the reader is the minimal TLV walk the
//! issuer-DN extraction needs. Only the subset of DER that X.509 building
//! touches is implemented.

use chrono::{DateTime, Datelike, Timelike, Utc};

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DerError {
	#[error("truncated DER element")]
	Truncated,

	#[error("unsupported DER length form")]
	BadLength,
}

/// DER definite-form length octets.
pub fn encode_length(len: usize) -> Vec<u8> {
	if len < 0x80 {
		return vec![len as u8];
	}
	let be = len.to_be_bytes();
	let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
	let mut out = Vec::with_capacity(1 + be.len() - first);
	out.push(0x80 | (be.len() - first) as u8);
	out.extend_from_slice(&be[first..]);
	out
}

/// A single tag-length-value element.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(2 + content.len());
	out.push(tag);
	out.extend_from_slice(&encode_length(content.len()));
	out.extend_from_slice(content);
	out
}

pub fn sequence(children: &[&[u8]]) -> Vec<u8> {
	tlv(TAG_SEQUENCE, &children.concat())
}

pub fn set(children: &[&[u8]]) -> Vec<u8> {
	tlv(TAG_SET, &children.concat())
}

/// INTEGER from magnitude bytes: minimal encoding, leading zero added when
/// the high bit would otherwise read as a sign.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
	let stripped: &[u8] = match magnitude.iter().position(|b| *b != 0) {
		Some(i) => &magnitude[i..],
		None => &[0],
	};
	if stripped[0] & 0x80 != 0 {
		let mut content = Vec::with_capacity(stripped.len() + 1);
		content.push(0);
		content.extend_from_slice(stripped);
		tlv(TAG_INTEGER, &content)
	} else {
		tlv(TAG_INTEGER, stripped)
	}
}

pub fn boolean(value: bool) -> Vec<u8> {
	tlv(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

pub fn null() -> Vec<u8> {
	tlv(TAG_NULL, &[])
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
	tlv(TAG_OCTET_STRING, content)
}

/// BIT STRING with no unused bits, the only form X.509 signatures and
/// SubjectPublicKeyInfo need.
pub fn bit_string(content: &[u8]) -> Vec<u8> {
	let mut inner = Vec::with_capacity(content.len() + 1);
	inner.push(0);
	inner.extend_from_slice(content);
	tlv(TAG_BIT_STRING, &inner)
}

pub fn utf8_string(s: &str) -> Vec<u8> {
	tlv(TAG_UTF8_STRING, s.as_bytes())
}

pub fn printable_string(s: &str) -> Vec<u8> {
	tlv(TAG_PRINTABLE_STRING, s.as_bytes())
}

/// OBJECT IDENTIFIER from its arc list.
pub fn oid(arcs: &[u64]) -> Vec<u8> {
	debug_assert!(arcs.len() >= 2);
	let mut content = vec![(arcs[0] * 40 + arcs[1]) as u8];
	for arc in &arcs[2..] {
		content.extend_from_slice(&base128(*arc));
	}
	tlv(TAG_OID, &content)
}

fn base128(mut value: u64) -> Vec<u8> {
	let mut out = vec![(value & 0x7f) as u8];
	value >>= 7;
	while value > 0 {
		out.push(0x80 | (value & 0x7f) as u8);
		value >>= 7;
	}
	out.reverse();
	out
}

/// UTCTime (`YYMMDDHHMMSSZ`), the validity encoding for dates before 2050.
pub fn utc_time(ts: DateTime<Utc>) -> Vec<u8> {
	let s = format!(
		"{:02}{:02}{:02}{:02}{:02}{:02}Z",
		ts.year() % 100,
		ts.month(),
		ts.day(),
		ts.hour(),
		ts.minute(),
		ts.second()
	);
	tlv(TAG_UTC_TIME, s.as_bytes())
}

/// Context-specific constructed tag wrapping a complete inner element
/// (EXPLICIT tagging).
pub fn explicit(tag_number: u8, inner: &[u8]) -> Vec<u8> {
	tlv(0xa0 | tag_number, inner)
}

/// Context-specific primitive tag replacing the inner tag (IMPLICIT
/// tagging over a primitive type).
pub fn implicit(tag_number: u8, content: &[u8]) -> Vec<u8> {
	tlv(0x80 | tag_number, content)
}

/// One parsed element: its tag, raw encoding (header included) and content
/// slice.
#[derive(Clone, Copy, Debug)]
pub struct Tlv<'a> {
	pub tag: u8,
	pub raw: &'a [u8],
	pub content: &'a [u8],
}

/// Read the element at the front of `input`, returning it and the bytes
/// that follow it. Indefinite lengths are rejected; certificates never
/// carry them.
pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), DerError> {
	if input.len() < 2 {
		return Err(DerError::Truncated);
	}
	let tag = input[0];
	let first = input[1];
	let (len, header) = if first < 0x80 {
		(first as usize, 2)
	} else {
		let n = (first & 0x7f) as usize;
		if n == 0 || n > 8 || input.len() < 2 + n {
			return Err(DerError::BadLength);
		}
		let mut len = 0usize;
		for b in &input[2..2 + n] {
			len = len.checked_shl(8).ok_or(DerError::BadLength)? | *b as usize;
		}
		(len, 2 + n)
	};
	if input.len() < header + len {
		return Err(DerError::Truncated);
	}
	let tlv = Tlv {
		tag,
		raw: &input[..header + len],
		content: &input[header..header + len],
	};
	Ok((tlv, &input[header + len..]))
}

#[cfg(test)]
#[path = "der_tests.rs"]
mod tests;
