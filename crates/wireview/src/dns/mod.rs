//! DNS wire-format helpers for the capture pipeline: pull the interesting
//! fields out of queries and answers, and synthesize a SERVFAIL when every
//! resolution path is gone.

pub mod doh;
pub mod relay;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::BinDecodable;

/// What a query tells us, for the DNS record.
#[derive(Clone, Debug)]
pub struct QueryInfo {
	pub id: u16,
	pub domain: String,
	pub query_type: String,
}

pub fn parse_query(wire: &[u8]) -> Option<QueryInfo> {
	let message = Message::from_bytes(wire).ok()?;
	let query = message.queries.first()?;
	let mut domain = query.name().to_utf8();
	if domain.ends_with('.') && domain.len() > 1 {
		domain.pop();
	}
	Some(QueryInfo {
		id: message.metadata.id,
		domain,
		query_type: query.query_type().to_string(),
	})
}

/// What an answer tells us, for the DNS record.
#[derive(Clone, Debug, Default)]
pub struct AnswerInfo {
	pub rcode: String,
	pub answers: Vec<String>,
	pub ttl: Option<u32>,
}

pub fn parse_answer(wire: &[u8]) -> Option<AnswerInfo> {
	let message = Message::from_bytes(wire).ok()?;
	let answers: Vec<String> = message
		.answers
		.iter()
		.map(|record| match &record.data {
			RData::A(a) => a.to_string(),
			RData::AAAA(aaaa) => aaaa.to_string(),
			other => other.to_string(),
		})
		.collect();
	Some(AnswerInfo {
		rcode: rcode_name(message.metadata.response_code),
		ttl: message.answers.first().map(|r| r.ttl),
		answers,
	})
}

pub fn rcode_name(code: ResponseCode) -> String {
	match code {
		ResponseCode::NoError => "NOERROR".to_string(),
		ResponseCode::FormErr => "FORMERR".to_string(),
		ResponseCode::ServFail => "SERVFAIL".to_string(),
		ResponseCode::NXDomain => "NXDOMAIN".to_string(),
		ResponseCode::NotImp => "NOTIMP".to_string(),
		ResponseCode::Refused => "REFUSED".to_string(),
		other => other.to_string(),
	}
}

/// Build a bare SERVFAIL for a failed query: QR set, the query's ID and
/// opcode/RD bits echoed, RCODE=2, question section stripped. Works on
/// queries hickory refuses to parse; anything shorter than a header gets
/// an ID of zero.
pub fn synthesize_servfail(query: &[u8]) -> Vec<u8> {
	let mut header = [0u8; 12];
	if query.len() >= 12 {
		header[0] = query[0];
		header[1] = query[1];
		// opcode and RD carry over; QR=1.
		header[2] = 0x80 | (query[2] & 0x79);
	} else {
		header[2] = 0x80;
	}
	header[3] = 0x02;
	header.to_vec()
}

#[cfg(test)]
#[path = "dns_tests.rs"]
mod tests;
