pub mod store;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use store::CaptureStore;

/// Maximum number of body bytes retained on a captured message.
pub const BODY_PREVIEW_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
	Tcp,
	Udp,
	Http,
	Https,
	Dns,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
	pub method: String,
	pub url: String,
	pub http_version: String,
	/// Ordered as seen on the wire; duplicate names preserved.
	pub headers: Vec<(String, String)>,
	pub body_size: u64,
	pub body_preview: Bytes,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
	pub status: u16,
	pub reason: String,
	pub http_version: String,
	pub headers: Vec<(String, String)>,
	pub body_size: u64,
	pub body_preview: Bytes,
	/// Time from request capture to response completion.
	pub duration_ms: u64,
}

/// One captured flow as shipped to the consumer. `sequence_number` is the
/// store-wide mutation counter; consumers fetch deltas with it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedFlow {
	pub id: Uuid,
	pub parent_flow_id: Option<Uuid>,
	pub kind: FlowKind,
	pub host: String,
	pub port: u16,
	pub process_name: String,
	pub start_ts: DateTime<Utc>,
	pub end_ts: Option<DateTime<Utc>>,
	pub request: Option<CapturedRequest>,
	pub response: Option<CapturedResponse>,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub error: Option<String>,
	pub sequence_number: u64,
}

impl CapturedFlow {
	pub fn new(
		kind: FlowKind,
		host: impl Into<String>,
		port: u16,
		process_name: impl Into<String>,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			parent_flow_id: None,
			kind,
			host: host.into(),
			port,
			process_name: process_name.into(),
			start_ts: Utc::now(),
			end_ts: None,
			request: None,
			response: None,
			bytes_in: 0,
			bytes_out: 0,
			error: None,
			sequence_number: 0,
		}
	}
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsQueryRecord {
	pub domain: String,
	pub query_type: String,
	pub process_name: String,
	pub rcode: String,
	pub answers: Vec<String>,
	pub ttl: Option<u32>,
	pub latency_ms: u64,
	pub is_encrypted: bool,
	pub sequence_number: u64,
}

#[cfg(test)]
#[path = "capture_tests.rs"]
mod tests;
