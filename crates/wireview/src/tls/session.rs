//! Client-facing TLS over a claimed byte flow.
//!
//! rustls's `ServerConnection` is a synchronous record machine: it consumes
//! ciphertext when asked, produces ciphertext when asked, and reports
//! would-block when it needs more input. This module bridges that machine
//! to the completion-handler `TcpFlow` world:
//!
//! - a background flow reader appends ciphertext to a bounded inbound
//!   buffer and wakes any suspended readers;
//! - all record-machine access is serialized behind one async mutex;
//! - nothing awaits flow I/O while holding that mutex: outbound records
//!   are drained under the lock and written to the flow after it is
//!   released. Concurrent `read` and `write` interleave through the lock
//!   instead of deadlocking on each other.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use rustls::ServerConnection;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::TlsError;
use crate::ca::MintedIdentity;
use crate::transport::{MAX_BUFFER_SIZE, TcpFlow};

/// Ciphertext the flow reader may buffer ahead of the record machine.
const INBOUND_LIMIT: usize = MAX_BUFFER_SIZE;

/// Plaintext the record machine may buffer before `write` sees
/// would-block and has to flush.
const PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

/// Suspended readers. Overflow is resumed immediately and treated as a
/// spurious wakeup by the caller's retry loop.
const MAX_WAITERS: usize = 64;

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);
const MAX_WRITE_RETRIES: u32 = 100;
const FLOW_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How much plaintext a single `read` returns at most.
pub const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone)]
pub struct TlsSession {
	shared: Arc<Shared>,
}

struct Shared {
	flow: Arc<dyn TcpFlow>,
	/// The serialization point for every record-machine call.
	conn: tokio::sync::Mutex<ServerConnection>,
	inbound: Mutex<Inbound>,
	waiters: Mutex<Vec<oneshot::Sender<()>>>,
	/// Parks the flow reader while the inbound buffer is at capacity.
	drained: tokio::sync::Notify,
	closed: AtomicBool,
	eof_delivered: AtomicBool,
}

#[derive(Default)]
struct Inbound {
	buf: BytesMut,
	eof: bool,
}

impl TlsSession {
	/// Stand up a server-side session for `identity` over `flow` and start
	/// the flow reader. The handshake is not driven yet; call
	/// [`TlsSession::handshake`].
	pub fn new(flow: Arc<dyn TcpFlow>, identity: &MintedIdentity) -> Result<Self, TlsError> {
		let config = super::mitm_server_config(identity)?;
		let mut conn = ServerConnection::new(config)?;
		conn.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));

		let shared = Arc::new(Shared {
			flow,
			conn: tokio::sync::Mutex::new(conn),
			inbound: Mutex::new(Inbound::default()),
			waiters: Mutex::new(Vec::new()),
			drained: tokio::sync::Notify::new(),
			closed: AtomicBool::new(false),
			eof_delivered: AtomicBool::new(false),
		});

		tokio::spawn(flow_reader(Arc::downgrade(&shared)));
		Ok(Self { shared })
	}

	/// Drive the handshake to completion under a wall-clock deadline.
	pub async fn handshake(&self) -> Result<(), TlsError> {
		tokio::time::timeout(HANDSHAKE_TIMEOUT, self.drive_handshake())
			.await
			.map_err(|_| TlsError::HandshakeTimeout)?
	}

	async fn drive_handshake(&self) -> Result<(), TlsError> {
		loop {
			if self.shared.closed.load(Ordering::Acquire) {
				return Err(TlsError::Closed);
			}
			let (outbound, done) = {
				let mut conn = self.shared.conn.lock().await;
				let outbound = self.shared.advance(&mut conn)?;
				(outbound, !conn.is_handshaking())
			};
			self.write_flow(outbound).await?;
			if done {
				trace!("handshake complete");
				return Ok(());
			}
			if self.shared.at_eof() {
				return Err(TlsError::Handshake("peer closed during handshake".to_string()));
			}
			self.wait_for_data().await;
		}
	}

	/// Read up to `max` decrypted bytes. Empty means the peer is done
	/// (close_notify or transport EOF).
	pub async fn read(&self, max: usize) -> Result<Bytes, TlsError> {
		loop {
			if self.shared.closed.load(Ordering::Acquire) {
				return Err(TlsError::Closed);
			}
			let (outbound, plaintext) = {
				let mut conn = self.shared.conn.lock().await;
				let outbound = self.shared.advance(&mut conn)?;
				let mut buf = vec![0u8; max.min(READ_CHUNK)];
				let plaintext = match conn.reader().read(&mut buf) {
					Ok(0) => Some(Bytes::new()),
					Ok(n) => {
						buf.truncate(n);
						Some(Bytes::from(buf))
					},
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
					// Transport EOF without close_notify; surfaced as EOF,
					// the relay treats truncation as connection close.
					Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Some(Bytes::new()),
					Err(e) => return Err(TlsError::Read(e.to_string())),
				};
				(outbound, plaintext)
			};
			self.write_flow(outbound).await?;
			match plaintext {
				Some(data) => return Ok(data),
				None if self.shared.at_eof() => return Ok(Bytes::new()),
				None => self.wait_for_data().await,
			}
		}
	}

	/// Encrypt and send `data`, flushing records to the flow as the
	/// machine produces them. Zero progress backs off briefly; a stall
	/// that survives the retry budget is surfaced as a write failure.
	pub async fn write(&self, data: &[u8]) -> Result<(), TlsError> {
		let mut offset = 0;
		let mut stalls = 0u32;
		while offset < data.len() {
			if self.shared.closed.load(Ordering::Acquire) {
				return Err(TlsError::Closed);
			}
			let (outbound, wrote) = {
				let mut conn = self.shared.conn.lock().await;
				let wrote = match conn.writer().write(&data[offset..]) {
					Ok(n) => n,
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
					Err(e) => return Err(TlsError::Write(e.to_string())),
				};
				(Shared::flush_outbound(&mut conn)?, wrote)
			};
			self.write_flow(outbound).await?;
			offset += wrote;
			if wrote == 0 {
				stalls += 1;
				if stalls > MAX_WRITE_RETRIES {
					return Err(TlsError::WriteStalled);
				}
				tokio::time::sleep(WRITE_RETRY_DELAY).await;
			} else {
				stalls = 0;
			}
		}
		Ok(())
	}

	/// Tear the session down. Idempotent; marks the session closed before
	/// any library-level close runs, and never blocks the caller on the
	/// serialization lock.
	pub fn close(&self) {
		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		debug!("closing tls session");
		let shared = self.shared.clone();
		tokio::spawn(async move {
			let outbound = {
				let mut conn = shared.conn.lock().await;
				conn.send_close_notify();
				Shared::flush_outbound(&mut conn).unwrap_or_default()
			};
			if !outbound.is_empty() {
				let _ = tokio::time::timeout(FLOW_WRITE_TIMEOUT, shared.flow.write(outbound.into())).await;
			}
			shared.flow.close_write();
			shared.flow.close_read();
		});
		self.shared.signal_data_available();
		self.shared.drained.notify_waiters();
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.load(Ordering::Acquire)
	}

	async fn write_flow(&self, outbound: Vec<u8>) -> Result<(), TlsError> {
		if outbound.is_empty() {
			return Ok(());
		}
		tokio::time::timeout(FLOW_WRITE_TIMEOUT, self.shared.flow.write(outbound.into()))
			.await
			.map_err(|_| TlsError::WriteTimeout)??;
		Ok(())
	}

	/// Suspend until the flow reader buffers more ciphertext, the peer
	/// reaches EOF, or the session closes. Registration is checked against
	/// the buffer under its lock, so a wakeup between the caller's poll
	/// and this suspension is never lost.
	async fn wait_for_data(&self) {
		let rx = {
			let inbound = self.shared.inbound.lock();
			if !inbound.buf.is_empty() || inbound.eof || self.shared.closed.load(Ordering::Acquire) {
				return;
			}
			let mut waiters = self.shared.waiters.lock();
			if waiters.len() >= MAX_WAITERS {
				return;
			}
			let (tx, rx) = oneshot::channel();
			waiters.push(tx);
			rx
		};
		let _ = rx.await;
	}
}

impl Shared {
	fn at_eof(&self) -> bool {
		let inbound = self.inbound.lock();
		inbound.eof && inbound.buf.is_empty()
	}

	fn signal_data_available(&self) {
		for waiter in self.waiters.lock().drain(..) {
			let _ = waiter.send(());
		}
	}

	/// Feed buffered ciphertext into the record machine and collect
	/// whatever it wants on the wire. Runs entirely under the
	/// serialization lock and never sleeps there; an empty inbound buffer
	/// reads as would-block.
	fn advance(&self, conn: &mut ServerConnection) -> Result<Vec<u8>, TlsError> {
		loop {
			let taken = {
				let mut inbound = self.inbound.lock();
				if inbound.buf.is_empty() {
					if inbound.eof && !self.eof_delivered.swap(true, Ordering::AcqRel) {
						let _ = conn.read_tls(&mut std::io::empty());
					}
					break;
				}
				let mut cursor = std::io::Cursor::new(&inbound.buf[..]);
				let n = conn
					.read_tls(&mut cursor)
					.map_err(|e| TlsError::Protocol(e.to_string()))?;
				inbound.buf.advance(n);
				n
			};
			// Room just opened up for a parked flow reader.
			self.drained.notify_waiters();
			if taken == 0 {
				break;
			}
			if let Err(e) = conn.process_new_packets() {
				// The machine queues an alert for the peer; ship it before
				// surfacing the failure.
				let _ = Self::flush_outbound(conn);
				return Err(TlsError::Protocol(e.to_string()));
			}
		}
		Self::flush_outbound(conn)
	}

	fn flush_outbound(conn: &mut ServerConnection) -> Result<Vec<u8>, TlsError> {
		let mut out = Vec::new();
		while conn.wants_write() {
			conn
				.write_tls(&mut out)
				.map_err(|e| TlsError::Write(e.to_string()))?;
		}
		Ok(out)
	}
}

/// Background task: pull from the flow into the inbound buffer, waking
/// suspended readers as data lands. Holds only a weak reference so an
/// abandoned session shuts its reader down.
async fn flow_reader(shared: std::sync::Weak<Shared>) {
	loop {
		let Some(strong) = shared.upgrade() else {
			return;
		};
		if strong.closed.load(Ordering::Acquire) {
			return;
		}
		match strong.flow.read().await {
			Ok(chunk) if chunk.is_empty() => {
				strong.inbound.lock().eof = true;
				strong.signal_data_available();
				return;
			},
			Ok(chunk) => {
				let mut chunk = &chunk[..];
				while !chunk.is_empty() {
					// Register for the drain wakeup before looking at the
					// buffer. A reader that drains and notifies between the
					// lock release and the await would otherwise be missed,
					// and nothing re-notifies a full, untouched buffer.
					let notified = strong.drained.notified();
					tokio::pin!(notified);
					notified.as_mut().enable();
					let room = {
						let mut inbound = strong.inbound.lock();
						let room = INBOUND_LIMIT.saturating_sub(inbound.buf.len());
						let take = room.min(chunk.len());
						inbound.buf.extend_from_slice(&chunk[..take]);
						chunk = &chunk[take..];
						room
					};
					strong.signal_data_available();
					if room == 0 {
						// At capacity: dropping ciphertext would desync the
						// record machine, so park until a reader drains it.
						notified.await;
						if strong.closed.load(Ordering::Acquire) {
							return;
						}
					}
				}
			},
			Err(e) => {
				trace!(error = %e, "flow read ended");
				strong.inbound.lock().eof = true;
				strong.signal_data_available();
				return;
			},
		}
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
