use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use crate::messaging::packet::Packet;
use crate::messaging::transport::WireOut;

/// A [WireOut] that keeps everything sent through it, for tests to inspect or answer.
#[derive(Debug, Default)]
pub struct RecordingWireOut {
    tracker: RwLock<Vec<Packet>>,
    sent: Notify,
    closed: AtomicBool,
}

impl RecordingWireOut {
    pub fn new() -> Arc<RecordingWireOut> {
        Default::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub async fn sent_packets(&self) -> Vec<Packet> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }

    /// waits until at least `n` packets were sent, then returns them, clearing the internal
    ///  buffer
    pub async fn wait_for_packets(&self, n: usize) -> Vec<Packet> {
        loop {
            let sent = self.sent.notified();
            {
                let mut lock = self.tracker.write().await;
                if lock.len() >= n {
                    return std::mem::take(&mut *lock);
                }
            }
            sent.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WireOut for RecordingWireOut {
    async fn wire_out(&self, packet: &Packet) -> anyhow::Result<()> {
        self.tracker.write().await.push(packet.clone());
        self.sent.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
