//! Handler used by the standalone host binary
//!
//! Without an upper protocol stack attached, inbound traffic is only logged
//! and counted.

use common::{BridgeHandler, BridgeId, UrbStatus};
use protocol::{CportId, MessageBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Logs everything a bridge delivers
pub struct LogHandler {
    bridge: BridgeId,
    frames: AtomicU64,
    svc_messages: AtomicU64,
}

impl LogHandler {
    pub fn new(bridge: BridgeId) -> Self {
        Self {
            bridge,
            frames: AtomicU64::new(0),
            svc_messages: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn svc_messages(&self) -> u64 {
        self.svc_messages.load(Ordering::Relaxed)
    }
}

impl BridgeHandler for LogHandler {
    fn data_received(&self, cport: CportId, payload: &[u8]) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] {} received {} bytes",
            self.bridge,
            cport,
            payload.len()
        );
    }

    fn svc_received(&self, message: &[u8]) {
        self.svc_messages.fetch_add(1, Ordering::Relaxed);
        info!("[{}] SVC message, {} bytes", self.bridge, message.len());
    }

    fn data_sent(&self, buffer: MessageBuffer, status: UrbStatus) {
        if status == UrbStatus::Completed {
            debug!("[{}] sent {} bytes", self.bridge, buffer.len());
        } else {
            warn!(
                "[{}] send of {} bytes finished with {}",
                self.bridge,
                buffer.len(),
                status
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_inbound_traffic() {
        let handler = LogHandler::new(BridgeId { bus: 1, address: 2 });
        handler.data_received(CportId(4), b"abc");
        handler.data_received(CportId(5), b"");
        handler.svc_received(b"hello");
        handler.data_sent(MessageBuffer::default(), UrbStatus::Cancelled);

        assert_eq!(handler.frames(), 2);
        assert_eq!(handler.svc_messages(), 1);
    }
}
