//! Test utilities for gb-bridge
//!
//! Provides a scriptable [`MockBus`] that honours the [`HostBus`] contract, a
//! [`RecordingHandler`] that captures everything delivered upward, and helper
//! functions shared by the crates' tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBus, es2_endpoints};
//! use common::create_completion_queue;
//!
//! let (tx, _rx) = create_completion_queue(16);
//! let bus = MockBus::new(tx);
//! assert_eq!(bus.in_flight(), 0);
//! assert_eq!(es2_endpoints().len(), 3);
//! ```

use crate::channel::CompletionSender;
use crate::handler::BridgeHandler;
use crate::usb_types::{
    BusError, Completion, ControlSetup, EndpointDescriptor, EndpointType, HostBus, SubmitError,
    Urb, UrbId, UrbStatus,
};
use protocol::{CportId, MessageBuffer};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt-in endpoint used by [`es2_endpoints`]
pub const MOCK_SVC_ENDPOINT: u8 = 0x81;
/// Bulk-in endpoint used by [`es2_endpoints`]
pub const MOCK_CPORT_IN_ENDPOINT: u8 = 0x82;
/// Bulk-out endpoint used by [`es2_endpoints`]
pub const MOCK_CPORT_OUT_ENDPOINT: u8 = 0x02;

/// The three interface endpoints an ES2 bridge exposes
pub fn es2_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor {
            address: MOCK_SVC_ENDPOINT,
            transfer_type: EndpointType::Interrupt,
            interval: 4,
        },
        EndpointDescriptor {
            address: MOCK_CPORT_IN_ENDPOINT,
            transfer_type: EndpointType::Bulk,
            interval: 0,
        },
        EndpointDescriptor {
            address: MOCK_CPORT_OUT_ENDPOINT,
            transfer_type: EndpointType::Bulk,
            interval: 0,
        },
    ]
}

#[derive(Default)]
struct MockState {
    /// Requests currently owned by the "hardware", oldest first
    pending: Vec<Urb>,
    /// Every OUT transfer's bytes, in submission order
    wire_out: Vec<Vec<u8>>,
    /// Every submitted request id, in order
    submitted: Vec<UrbId>,
    /// Every id passed to kill()
    killed: Vec<UrbId>,
    /// Every id passed to unlink()
    unlinked: Vec<UrbId>,
    /// Leave outbound requests running when they are killed or unlinked
    stuck_sends: bool,
    /// Control transfers seen by control_out()
    control: Vec<(ControlSetup, Vec<u8>)>,
    /// Fail this many upcoming submissions
    fail_submits: usize,
    /// Let this many submissions through, then fail the next one
    fail_after: Option<usize>,
    /// Error returned by control_out(), if any
    control_error: Option<BusError>,
    /// Accept fewer bytes than asked in control_out()
    short_control_write: bool,
    /// Total completions posted
    completed: usize,
}

/// Scriptable host bus
///
/// Submitted requests stay pending until a test completes them with one of
/// the `complete_*`/`deliver_*` helpers. Completions go through the real
/// completion queue, so the transport sees them exactly as it would in
/// production once the test drains the queue.
pub struct MockBus {
    completions: CompletionSender,
    state: Mutex<MockState>,
}

impl MockBus {
    pub fn new(completions: CompletionSender) -> Self {
        Self {
            completions,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` submissions fail
    pub fn fail_next_submits(&self, count: usize) {
        self.state().fail_submits = count;
    }

    /// Let `count` submissions succeed, then fail the one after
    pub fn fail_nth_submit(&self, count: usize) {
        self.state().fail_after = Some(count);
    }

    /// Make outbound requests ignore kill() and unlink(), as a wedged
    /// host controller would
    pub fn stick_sends(&self, stuck: bool) {
        self.state().stuck_sends = stuck;
    }

    /// Make control_out() fail with `error`
    pub fn fail_control(&self, error: Option<BusError>) {
        self.state().control_error = error;
    }

    /// Make control_out() report a short write
    pub fn short_control_write(&self, short: bool) {
        self.state().short_control_write = short;
    }

    /// Number of requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.state().pending.len()
    }

    /// Ids of requests currently in flight, oldest first
    pub fn pending_ids(&self) -> Vec<UrbId> {
        self.state().pending.iter().map(|u| u.id).collect()
    }

    /// In-flight outbound request ids, oldest first
    pub fn pending_out(&self) -> Vec<UrbId> {
        self.pending_ids()
            .into_iter()
            .filter(|id| matches!(id, UrbId::CportOut(_)))
            .collect()
    }

    /// Bytes of every OUT transfer submitted so far
    pub fn wire_out(&self) -> Vec<Vec<u8>> {
        self.state().wire_out.clone()
    }

    /// How many times `id` has been submitted
    pub fn submissions_of(&self, id: UrbId) -> usize {
        self.state().submitted.iter().filter(|s| **s == id).count()
    }

    pub fn killed(&self) -> Vec<UrbId> {
        self.state().killed.clone()
    }

    pub fn unlinked(&self) -> Vec<UrbId> {
        self.state().unlinked.clone()
    }

    pub fn control_transfers(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.state().control.clone()
    }

    pub fn completed(&self) -> usize {
        self.state().completed
    }

    fn take_pending<F>(&self, pred: F) -> Option<Urb>
    where
        F: Fn(&Urb) -> bool,
    {
        let mut state = self.state();
        let pos = state.pending.iter().position(pred)?;
        Some(state.pending.remove(pos))
    }

    fn post(&self, urb: Urb, status: UrbStatus, actual_length: usize) -> bool {
        self.state().completed += 1;
        self.completions
            .post(Completion {
                urb,
                status,
                actual_length,
            })
            .is_ok()
    }

    /// Finish the outbound request `id` with `status`
    pub fn complete(&self, id: UrbId, status: UrbStatus) -> bool {
        match self.take_pending(|u| u.id == id) {
            Some(urb) => {
                let len = if status == UrbStatus::Completed {
                    urb.transfer_len()
                } else {
                    0
                };
                self.post(urb, status, len)
            }
            None => false,
        }
    }

    /// Finish the oldest outbound request with `status`
    pub fn complete_next_out(&self, status: UrbStatus) -> bool {
        match self.pending_out().first() {
            Some(id) => self.complete(*id, status),
            None => false,
        }
    }

    /// Fill the oldest CPort receive request with `frame`
    pub fn deliver_cport_frame(&self, frame: &[u8]) -> bool {
        self.deliver(|u| matches!(u.id, UrbId::CportIn(_)), frame)
    }

    /// Fill the SVC receive request with `message`
    pub fn deliver_svc(&self, message: &[u8]) -> bool {
        self.deliver(|u| u.id == UrbId::SvcIn, message)
    }

    fn deliver<F>(&self, pred: F, data: &[u8]) -> bool
    where
        F: Fn(&Urb) -> bool,
    {
        let Some(mut urb) = self.take_pending(pred) else {
            return false;
        };
        let (status, len) = if data.len() > urb.transfer_len() {
            (UrbStatus::Overflow, urb.transfer_len())
        } else {
            (UrbStatus::Completed, data.len())
        };
        urb.transfer_mut()[..len].copy_from_slice(&data[..len]);
        self.post(urb, status, len)
    }

    fn abort(&self, id: UrbId) {
        if matches!(id, UrbId::CportOut(_)) && self.state().stuck_sends {
            return;
        }
        if let Some(urb) = self.take_pending(|u| u.id == id) {
            self.post(urb, UrbStatus::Cancelled, 0);
        }
    }

    /// Fail the oldest CPort receive request with `status`
    pub fn fail_cport_in(&self, status: UrbStatus) -> bool {
        match self.take_pending(|u| matches!(u.id, UrbId::CportIn(_))) {
            Some(urb) => self.post(urb, status, 0),
            None => false,
        }
    }

    /// Fail the SVC receive request with `status`
    pub fn fail_svc(&self, status: UrbStatus) -> bool {
        match self.take_pending(|u| u.id == UrbId::SvcIn) {
            Some(urb) => self.post(urb, status, 0),
            None => false,
        }
    }
}

impl HostBus for MockBus {
    fn submit(&self, urb: Urb) -> Result<(), SubmitError> {
        let mut state = self.state();
        let fail = match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                true
            }
            Some(n) => {
                state.fail_after = Some(n - 1);
                false
            }
            None if state.fail_submits > 0 => {
                state.fail_submits -= 1;
                true
            }
            None => false,
        };
        if fail {
            return Err(SubmitError {
                urb,
                error: BusError::Io("injected failure".to_string()),
            });
        }
        state.submitted.push(urb.id);
        if !urb.is_in() {
            state.wire_out.push(urb.transfer().to_vec());
        }
        state.pending.push(urb);
        Ok(())
    }

    fn unlink(&self, id: UrbId) {
        self.state().unlinked.push(id);
        self.abort(id);
    }

    fn kill(&self, id: UrbId) {
        self.state().killed.push(id);
        self.abort(id);
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, BusError> {
        let mut state = self.state();
        if let Some(error) = state.control_error.clone() {
            return Err(error);
        }
        state.control.push((setup, data.to_vec()));
        if state.short_control_write {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }
}

/// Everything a bridge delivered upward, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Data { cport: CportId, payload: Vec<u8> },
    Svc(Vec<u8>),
    Sent { payload: Vec<u8>, status: UrbStatus },
}

/// Handler that records every callback
#[derive(Default)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Received CPort frames only
    pub fn received(&self) -> Vec<(CportId, Vec<u8>)> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Data { cport, payload } => Some((cport, payload)),
                _ => None,
            })
            .collect()
    }

    /// Send completions only
    pub fn sent(&self) -> Vec<(Vec<u8>, UrbStatus)> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Sent { payload, status } => Some((payload, status)),
                _ => None,
            })
            .collect()
    }

    /// SVC messages only
    pub fn svc(&self) -> Vec<Vec<u8>> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Svc(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, delivery: Delivery) {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(delivery);
    }
}

impl BridgeHandler for RecordingHandler {
    fn data_received(&self, cport: CportId, payload: &[u8]) {
        self.push(Delivery::Data {
            cport,
            payload: payload.to_vec(),
        });
    }

    fn svc_received(&self, message: &[u8]) {
        self.push(Delivery::Svc(message.to_vec()));
    }

    fn data_sent(&self, buffer: MessageBuffer, status: UrbStatus) {
        self.push(Delivery::Sent {
            payload: buffer.payload().to_vec(),
            status,
        });
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
