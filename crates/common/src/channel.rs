//! Async channels between bus completions, the dispatcher and the lifecycle layer
//!
//! Completions are posted by the bus (from whatever thread finishes the I/O)
//! and consumed by a dispatcher that drives the transport. Bridge events flow
//! the other way, from completion handling up to the lifecycle manager.

use crate::usb_types::{BridgeId, Completion, UrbStatus};
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

/// Events raised by a bridge for the lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A fatal transfer status showed the device is gone
    Disconnected {
        /// Bridge that disconnected
        bridge: BridgeId,
        /// Status that triggered the disconnect
        status: UrbStatus,
    },
}

/// Bus side of the completion queue
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Post a completion without blocking
    ///
    /// On failure the completion is handed back so the caller can log it.
    pub fn post(&self, completion: Completion) -> Result<(), Box<Completion>> {
        self.tx.try_send(completion).map_err(|e| match e {
            TrySendError::Full(c) | TrySendError::Closed(c) => Box::new(c),
        })
    }

    /// Post a completion, waiting for room (bus worker threads only)
    pub fn post_blocking(&self, completion: Completion) -> crate::Result<()> {
        self.tx
            .send_blocking(completion)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Dispatcher side of the completion queue
pub struct CompletionReceiver {
    rx: Receiver<Completion>,
}

impl CompletionReceiver {
    /// Wait for the next completion
    pub async fn recv(&self) -> crate::Result<Completion> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take a completion if one is queued
    pub fn try_recv(&self) -> Option<Completion> {
        match self.rx.try_recv() {
            Ok(c) => Some(c),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the completion queue
///
/// `depth` must cover every request that can be in flight at once, so that
/// posting from a completion context never finds the queue full.
pub fn create_completion_queue(depth: usize) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = bounded(depth.max(1));
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Raises bridge events without blocking
#[derive(Clone)]
pub struct EventNotifier {
    tx: Sender<BridgeEvent>,
}

impl EventNotifier {
    pub fn notify(&self, event: BridgeEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Receives bridge events in the lifecycle manager
#[derive(Clone)]
pub struct BridgeEvents {
    rx: Receiver<BridgeEvent>,
}

impl BridgeEvents {
    pub async fn recv_event(&self) -> crate::Result<BridgeEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn try_recv_event(&self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the bridge event channel
pub fn create_event_channel() -> (EventNotifier, BridgeEvents) {
    let (tx, rx) = bounded(64);
    (EventNotifier { tx }, BridgeEvents { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_types::{TransferKind, Urb, UrbId};

    fn completion() -> Completion {
        Completion {
            urb: Urb {
                id: UrbId::SvcIn,
                endpoint: 0x81,
                kind: TransferKind::Bulk,
                buffer: vec![1, 2, 3],
                offset: 0,
            },
            status: UrbStatus::Completed,
            actual_length: 3,
        }
    }

    #[tokio::test]
    async fn test_completion_queue() {
        let (tx, rx) = create_completion_queue(4);

        // Post from a plain thread, the way a bus worker does
        let handle = std::thread::spawn(move || tx.post_blocking(completion()).is_ok());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data(), &[1, 2, 3]);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_post_hands_back_on_full_queue() {
        let (tx, rx) = create_completion_queue(1);
        assert!(tx.post(completion()).is_ok());

        let rejected = tx.post(completion()).unwrap_err();
        assert_eq!(rejected.status, UrbStatus::Completed);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_try_recv_empty() {
        let (_tx, rx) = create_completion_queue(1);
        assert!(rx.try_recv().is_none());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_event_channel() {
        let (notifier, events) = create_event_channel();
        let bridge = BridgeId { bus: 1, address: 4 };
        notifier
            .notify(BridgeEvent::Disconnected {
                bridge,
                status: UrbStatus::NoDevice,
            })
            .unwrap();

        assert_eq!(
            events.try_recv_event(),
            Some(BridgeEvent::Disconnected {
                bridge,
                status: UrbStatus::NoDevice
            })
        );
    }
}
