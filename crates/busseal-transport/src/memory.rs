//! In-process broadcast bus.
//!
//! Built on a Tokio broadcast channel. Each port stamps outgoing frames with
//! its own port number and skips them on receive.

use crate::transport::{
    BusFrame, BusTransport, TransportError, TransportResult, TransportStats, check_frame_len,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::trace;

#[derive(Debug, Clone)]
struct Envelope {
    port: u64,
    frame: BusFrame,
}

/// Shared medium that hands out ports.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Envelope>,
    next_port: Arc<AtomicU64>,
}

impl MemoryBus {
    /// Create a bus buffering up to `capacity` frames per slow receiver.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            next_port: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a new port.
    ///
    /// The port sees frames sent after it was attached.
    #[must_use]
    pub fn port(&self) -> MemoryPort {
        let (closed, _) = watch::channel(false);
        MemoryPort {
            port: self.next_port.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            closed,
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

/// One node's attachment to a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryPort {
    port: u64,
    tx: broadcast::Sender<Envelope>,
    rx: Mutex<broadcast::Receiver<Envelope>>,
    closed: watch::Sender<bool>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
}

#[async_trait]
impl BusTransport for MemoryPort {
    async fn send_frame(&self, id: u32, data: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        check_frame_len(data)?;

        let envelope = Envelope {
            port: self.port,
            frame: BusFrame {
                id,
                data: data.to_vec(),
            },
        };
        if self.tx.send(envelope).is_err() {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Closed);
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(port = self.port, id, len = data.len(), "frame sent");
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<BusFrame> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = closed.changed() => return Err(TransportError::Closed),
                received = rx.recv() => match received {
                    Ok(envelope) if envelope.port == self.port => {}
                    Ok(envelope) => {
                        self.frames_received.fetch_add(1, Ordering::Relaxed);
                        return Ok(envelope.frame);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Err(TransportError::Lagged(n));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::Closed);
                    }
                },
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: 0,
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
