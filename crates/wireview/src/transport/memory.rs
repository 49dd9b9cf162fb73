//! In-memory flow endpoints. The interception layer hands the router real
//! OS-backed flows; these channel-backed twins exist so the relay paths can
//! be driven end-to-end in-process (integration tests, local harnesses).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use super::{Datagram, FlowError, TcpFlow, UdpFlow};

pub struct MemoryTcpFlow {
	rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
	tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
	read_closed: AtomicBool,
}

/// Build a connected pair of in-memory TCP flows. Bytes written on one end
/// are read on the other. Either end can be handed to the router as the
/// claimed flow; the other plays the application.
pub fn tcp_pair() -> (Arc<MemoryTcpFlow>, Arc<MemoryTcpFlow>) {
	let (a_tx, b_rx) = mpsc::channel(64);
	let (b_tx, a_rx) = mpsc::channel(64);
	let a = Arc::new(MemoryTcpFlow {
		rx: tokio::sync::Mutex::new(a_rx),
		tx: parking_lot::Mutex::new(Some(a_tx)),
		read_closed: AtomicBool::new(false),
	});
	let b = Arc::new(MemoryTcpFlow {
		rx: tokio::sync::Mutex::new(b_rx),
		tx: parking_lot::Mutex::new(Some(b_tx)),
		read_closed: AtomicBool::new(false),
	});
	(a, b)
}

#[async_trait::async_trait]
impl TcpFlow for MemoryTcpFlow {
	async fn read(&self) -> Result<Bytes, FlowError> {
		if self.read_closed.load(Ordering::Acquire) {
			return Ok(Bytes::new());
		}
		let mut rx = self.rx.lock().await;
		// A closed peer reads as EOF, like a FIN on a socket.
		Ok(rx.recv().await.unwrap_or_default())
	}

	async fn write(&self, data: Bytes) -> Result<(), FlowError> {
		let tx = self.tx.lock().clone();
		match tx {
			Some(tx) => tx.send(data).await.map_err(|_| FlowError::Closed),
			None => Err(FlowError::Closed),
		}
	}

	fn close_read(&self) {
		self.read_closed.store(true, Ordering::Release);
	}

	fn close_write(&self) {
		self.tx.lock().take();
	}
}

/// A `TcpFlow` over one end of a `tokio::io::duplex` pipe. The other end
/// stays a plain `AsyncRead + AsyncWrite`, which lets harnesses run real
/// protocol clients (e.g. a rustls connector) against flow-based code.
pub struct DuplexFlow {
	read: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
	write: Arc<tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>>,
	read_closed: AtomicBool,
}

pub fn duplex_flow(capacity: usize) -> (Arc<DuplexFlow>, DuplexStream) {
	let (near, far) = tokio::io::duplex(capacity);
	let (read, write) = tokio::io::split(near);
	let flow = Arc::new(DuplexFlow {
		read: tokio::sync::Mutex::new(read),
		write: Arc::new(tokio::sync::Mutex::new(Some(write))),
		read_closed: AtomicBool::new(false),
	});
	(flow, far)
}

#[async_trait::async_trait]
impl TcpFlow for DuplexFlow {
	async fn read(&self) -> Result<Bytes, FlowError> {
		if self.read_closed.load(Ordering::Acquire) {
			return Ok(Bytes::new());
		}
		let mut half = self.read.lock().await;
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let n = half.read_buf(&mut buf).await?;
		buf.truncate(n);
		Ok(buf.freeze())
	}

	async fn write(&self, data: Bytes) -> Result<(), FlowError> {
		let mut half = self.write.lock().await;
		match half.as_mut() {
			Some(w) => Ok(w.write_all(&data).await?),
			None => Err(FlowError::Closed),
		}
	}

	fn close_read(&self) {
		self.read_closed.store(true, Ordering::Release);
	}

	fn close_write(&self) {
		let write = self.write.clone();
		tokio::spawn(async move {
			if let Some(mut w) = write.lock().await.take() {
				let _ = w.shutdown().await;
			}
		});
	}
}

pub struct MemoryUdpFlow {
	rx: tokio::sync::Mutex<mpsc::Receiver<Vec<Datagram>>>,
	tx: parking_lot::Mutex<Option<mpsc::Sender<Vec<Datagram>>>>,
}

/// Build a connected pair of in-memory UDP flows.
pub fn udp_pair() -> (Arc<MemoryUdpFlow>, Arc<MemoryUdpFlow>) {
	let (a_tx, b_rx) = mpsc::channel(64);
	let (b_tx, a_rx) = mpsc::channel(64);
	let a = Arc::new(MemoryUdpFlow {
		rx: tokio::sync::Mutex::new(a_rx),
		tx: parking_lot::Mutex::new(Some(a_tx)),
	});
	let b = Arc::new(MemoryUdpFlow {
		rx: tokio::sync::Mutex::new(b_rx),
		tx: parking_lot::Mutex::new(Some(b_tx)),
	});
	(a, b)
}

#[async_trait::async_trait]
impl UdpFlow for MemoryUdpFlow {
	async fn read_datagrams(&self) -> Result<Vec<Datagram>, FlowError> {
		let mut rx = self.rx.lock().await;
		Ok(rx.recv().await.unwrap_or_default())
	}

	async fn write_datagrams(&self, datagrams: Vec<Datagram>) -> Result<(), FlowError> {
		let tx = self.tx.lock().clone();
		match tx {
			Some(tx) => tx.send(datagrams).await.map_err(|_| FlowError::Closed),
			None => Err(FlowError::Closed),
		}
	}

	fn close(&self) {
		self.tx.lock().take();
	}
}
