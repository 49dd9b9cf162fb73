//! Opaque relay for traffic the inspector cannot (or chooses not to)
//! parse: plain byte copy in both directions with counters, and a single
//! capture record for the whole connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::{ActivityTracker, FlowRouter, deadline_guard};
use crate::capture::{CapturedFlow, FlowKind};
use crate::transport::{HostPort, TcpFlow};

const COPY_CHUNK: usize = 16 * 1024;

pub async fn run(
	router: &FlowRouter,
	flow: Arc<dyn TcpFlow>,
	remote: &HostPort,
	process: &str,
	kind: FlowKind,
) {
	let record = CapturedFlow::new(kind, &remote.host, remote.port, process);
	let id = router.store.add_flow(record);

	let origin = match router
		.dialer
		.dial(&remote.host, remote.port, router.timeouts.connect)
		.await
	{
		Ok(stream) => stream,
		Err(e) => {
			debug!(%remote, error = %e, "passthrough connect failed");
			router.store.complete_flow(id, 0, 0, Some(e.to_string()));
			flow.close_read();
			flow.close_write();
			return;
		},
	};
	let (origin_read, origin_write) = origin.into_split();

	let bytes_in = AtomicU64::new(0);
	let bytes_out = AtomicU64::new(0);
	let activity = ActivityTracker::new();

	tokio::select! {
		_ = copy_outbound(flow.clone(), origin_write, &bytes_out, &activity) => {},
		_ = copy_inbound(origin_read, flow.clone(), &bytes_in, &activity) => {},
		reason = deadline_guard(&activity, &router.timeouts) => {
			debug!(%remote, %reason, "passthrough deadline fired");
		},
	}

	router.store.complete_flow(
		id,
		bytes_in.load(Ordering::Relaxed),
		bytes_out.load(Ordering::Relaxed),
		None,
	);
	flow.close_read();
	flow.close_write();
}

/// Client → origin. Each write completes before the next read is issued.
async fn copy_outbound(
	flow: Arc<dyn TcpFlow>,
	mut origin: OwnedWriteHalf,
	bytes_out: &AtomicU64,
	activity: &ActivityTracker,
) {
	loop {
		let chunk = match flow.read().await {
			Ok(c) if !c.is_empty() => c,
			_ => break,
		};
		activity.touch();
		bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
		if origin.write_all(&chunk).await.is_err() {
			break;
		}
	}
	let _ = origin.shutdown().await;
}

/// Origin → client, same backpressure.
async fn copy_inbound(
	mut origin: OwnedReadHalf,
	flow: Arc<dyn TcpFlow>,
	bytes_in: &AtomicU64,
	activity: &ActivityTracker,
) {
	loop {
		let mut buf = BytesMut::with_capacity(COPY_CHUNK);
		match origin.read_buf(&mut buf).await {
			Ok(n) if n > 0 => {},
			_ => break,
		}
		activity.touch();
		bytes_in.fetch_add(buf.len() as u64, Ordering::Relaxed);
		if flow.write(buf.freeze()).await.is_err() {
			break;
		}
	}
	flow.close_write();
}
