use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{CapturedFlow, CapturedResponse, DnsQueryRecord};

/// Retention cap for each record table.
const MAX_RECORDS: usize = 10_000;
/// Trim is amortised: the tables are allowed to overshoot to 110% before
/// being cut back to the newest `MAX_RECORDS` suffix.
const TRIM_THRESHOLD: usize = MAX_RECORDS + MAX_RECORDS / 10;

/// Process-wide capture store: the in-memory record tables the consumer
/// IPC surface reads from.
///
/// One lock guards the flow table, the DNS table and the sequence counter.
/// Every externally observable mutation (insert, response attachment,
/// completion, DNS record) takes a fresh sequence number under that lock,
/// so `sequence_number` is strictly increasing and unique across the whole
/// store. Encoding for the consumer happens on clones, outside the lock.
#[derive(Debug, Default)]
pub struct CaptureStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	seq: u64,
	flows: IndexMap<Uuid, CapturedFlow>,
	dns: Vec<DnsQueryRecord>,
}

impl Inner {
	fn next_seq(&mut self) -> u64 {
		self.seq += 1;
		self.seq
	}
}

impl CaptureStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert the initial record for a flow. The record's sequence number is
	/// assigned here; any value the caller set is overwritten.
	pub fn add_flow(&self, mut flow: CapturedFlow) -> Uuid {
		let id = flow.id;
		let mut inner = self.inner.lock();
		flow.sequence_number = inner.next_seq();
		trace!(%id, host = %flow.host, seq = flow.sequence_number, "flow added");
		inner.flows.insert(id, flow);
		if inner.flows.len() > TRIM_THRESHOLD {
			let cut = inner.flows.len() - MAX_RECORDS;
			let kept = inner.flows.split_off(cut);
			inner.flows = kept;
		}
		id
	}

	/// Attach a completed response to an existing flow record. Optionally
	/// refreshes the request body size, for requests whose body was still
	/// streaming when the record was first emitted.
	pub fn update_flow(
		&self,
		id: Uuid,
		response: CapturedResponse,
		request_body_size: Option<u64>,
	) {
		let mut inner = self.inner.lock();
		let seq = inner.next_seq();
		if let Some(flow) = inner.flows.get_mut(&id) {
			if let (Some(size), Some(req)) = (request_body_size, flow.request.as_mut()) {
				req.body_size = size;
			}
			flow.response = Some(response);
			flow.sequence_number = seq;
		}
	}

	/// Final mutation for a flow: byte totals, optional error, end
	/// timestamp.
	pub fn complete_flow(&self, id: Uuid, bytes_in: u64, bytes_out: u64, error: Option<String>) {
		let mut inner = self.inner.lock();
		let seq = inner.next_seq();
		if let Some(flow) = inner.flows.get_mut(&id) {
			flow.bytes_in = bytes_in;
			flow.bytes_out = bytes_out;
			flow.end_ts = Some(Utc::now());
			if error.is_some() {
				flow.error = error;
			}
			flow.sequence_number = seq;
		}
	}

	pub fn record_dns_query(&self, mut record: DnsQueryRecord) {
		let mut inner = self.inner.lock();
		record.sequence_number = inner.next_seq();
		inner.dns.push(record);
		if inner.dns.len() > TRIM_THRESHOLD {
			let cut = inner.dns.len() - MAX_RECORDS;
			inner.dns.drain(..cut);
		}
	}

	/// Delta fetch: all flow records mutated after `since`, plus the current
	/// high-water sequence so the consumer can resume from it.
	pub fn get_flows_since(&self, since: u64) -> (u64, Vec<CapturedFlow>) {
		let inner = self.inner.lock();
		let flows = inner
			.flows
			.values()
			.filter(|f| f.sequence_number > since)
			.cloned()
			.collect();
		(inner.seq, flows)
	}

	pub fn get_dns_since(&self, since: u64) -> (u64, Vec<DnsQueryRecord>) {
		let inner = self.inner.lock();
		let dns = inner
			.dns
			.iter()
			.filter(|d| d.sequence_number > since)
			.cloned()
			.collect();
		(inner.seq, dns)
	}

	pub fn flow(&self, id: Uuid) -> Option<CapturedFlow> {
		self.inner.lock().flows.get(&id).cloned()
	}

	pub fn flow_count(&self) -> usize {
		self.inner.lock().flows.len()
	}

	pub fn dns_count(&self) -> usize {
		self.inner.lock().dns.len()
	}
}
