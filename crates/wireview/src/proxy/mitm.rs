//! The MITM path for port 443: mint an identity for the destination host,
//! terminate the client's TLS against it, open fresh TLS to the origin,
//! then run the shared HTTP relay over the decrypted streams.
//!
//! Fallback rules: no CA or a failed mint degrade the flow to passthrough
//! (the client has seen nothing yet). A failed client handshake does not
//! fall back; by then the client has already been shown our certificate,
//! so the flow is simply released.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::{debug, event, warn};

use super::httprelay::{HttpRelayContext, IoSink, IoSource, SessionSink, SessionSource, run_relay};
use super::{FlowRouter, passthrough};
use crate::capture::FlowKind;
use crate::tls::session::TlsSession;
use crate::tls::upstream;
use crate::transport::{HostPort, TcpFlow};

pub async fn run(router: &FlowRouter, flow: Arc<dyn TcpFlow>, remote: &HostPort, process: &str) {
	let start = Instant::now();
	let Some(minter) = router.minter.clone() else {
		passthrough::run(router, flow, remote, process, FlowKind::Https).await;
		return;
	};

	// RSA keygen is too heavy for the async workers.
	let host = remote.host.clone();
	let minted = tokio::task::spawn_blocking(move || minter.identity_for(&host)).await;
	let identity = match minted {
		Ok(Ok(identity)) => identity,
		Ok(Err(e)) => {
			warn!(%remote, error = %e, "mint failed, falling back to passthrough");
			passthrough::run(router, flow, remote, process, FlowKind::Https).await;
			return;
		},
		Err(e) => {
			warn!(%remote, error = %e, "mint task failed, falling back to passthrough");
			passthrough::run(router, flow, remote, process, FlowKind::Https).await;
			return;
		},
	};

	let session = match TlsSession::new(flow.clone(), &identity) {
		Ok(session) => session,
		Err(e) => {
			warn!(%remote, error = %e, "tls session setup failed, falling back to passthrough");
			passthrough::run(router, flow, remote, process, FlowKind::Https).await;
			return;
		},
	};

	if let Err(e) = session.handshake().await {
		// No passthrough from here: the client already saw our leaf.
		debug!(%remote, error = %e, "client handshake failed, releasing flow");
		session.close();
		return;
	}

	let origin = match router
		.dialer
		.dial(&remote.host, remote.port, router.timeouts.connect)
		.await
	{
		Ok(stream) => stream,
		Err(e) => {
			debug!(%remote, error = %e, "origin connect failed");
			session.close();
			return;
		},
	};
	let origin_tls = match upstream::handshake(origin, &remote.host).await {
		Ok(stream) => stream,
		Err(e) => {
			debug!(%remote, error = %e, "origin tls failed");
			session.close();
			return;
		},
	};
	let (origin_read, origin_write) = tokio::io::split(origin_tls);

	let ctx = HttpRelayContext::new(
		router.store.clone(),
		FlowKind::Https,
		&remote.host,
		remote.port,
		process,
	);
	run_relay(
		&ctx,
		SessionSource(session.clone()),
		SessionSink(session.clone()),
		IoSource(origin_read),
		IoSink(origin_write),
		&router.timeouts,
	)
	.await;

	session.close();
	flow.close_read();
	flow.close_write();

	event!(
		target: "flow",
		parent: None,
		tracing::Level::DEBUG,

		remote = %remote,
		process,

		bytes_in = ctx.bytes_in.load(Ordering::Relaxed),
		bytes_out = ctx.bytes_out.load(Ordering::Relaxed),
		duration_ms = start.elapsed().as_millis() as u64,

		"mitm relay completed"
	);
}
