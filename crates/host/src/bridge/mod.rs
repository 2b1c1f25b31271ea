//! Bridge transport core
//!
//! A [`Bridge`] turns one bulk-in/bulk-out endpoint pair plus the control and
//! interrupt endpoints of an ES2 bridge into any number of logical CPorts:
//!
//! - `sender`: outbound multiplexing over a fixed request pool
//! - `receiver`: always-armed inbound requests, demultiplexed by leading byte
//! - `svc`: the SVC link (interrupt-in receive, synchronous control send)
//! - `lifecycle`: endpoint discovery, attach, and ordered teardown
//!
//! All I/O goes through a [`HostBus`]. Completions come back as messages on
//! the completion queue and are fed to [`Bridge::complete`], either by the
//! [`run_dispatcher`] task or by [`Bridge::drain`].

pub mod lifecycle;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod status;
pub mod svc;

use common::{
    BridgeEvent, BridgeHandler, BridgeId, BusError, Completion, CompletionReceiver, EventNotifier,
    HostBus, OutSlot, UrbId, UrbStatus,
};
use pool::OutPool;
use protocol::{MessageBuffer, ProtocolError};
use stats::BridgeStats;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

pub use lifecycle::{Endpoints, discover_endpoints};
pub use stats::StatsSnapshot;
pub use status::{StatusClass, classify};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Number of CPort IN requests kept in flight
pub const NUM_CPORT_IN_URB: usize = 4;

/// Number of pooled CPort OUT requests
pub const NUM_CPORT_OUT_URB: usize = 8;

/// Time the SVC gets to accept a control message
pub const SVC_TIMEOUT: Duration = Duration::from_millis(500);

/// Tunables for one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Pooled outbound requests
    pub out_urbs: usize,
    /// Inbound CPort requests kept armed
    pub in_urbs: usize,
    /// Dynamically allocated outbound requests allowed on top of the pool
    pub max_overflow_urbs: usize,
    /// Default timeout for [`Bridge::send_svc_default`]
    pub svc_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            out_urbs: NUM_CPORT_OUT_URB,
            in_urbs: NUM_CPORT_IN_URB,
            max_overflow_urbs: 64,
            svc_timeout: SVC_TIMEOUT,
        }
    }
}

impl BridgeSettings {
    /// Queue depth that can hold a completion for every possible request
    pub fn completion_queue_depth(&self) -> usize {
        self.out_urbs + self.max_overflow_urbs + self.in_urbs + 1
    }
}

/// Opaque handle to an in-flight send, used only for [`Bridge::cancel`]
///
/// Carries the request's generation, so a cookie kept past its completion can
/// never cancel a later send that reuses the same pool slot. It is also tied
/// to the bridge instance that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie {
    instance: u64,
    slot: OutSlot,
}

/// Why a send was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendErrorKind {
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ProtocolError),

    #[error("Out of CPort OUT requests")]
    OutOfResources,

    #[error("Submission failed: {0}")]
    SubmissionFailed(BusError),

    #[error("Bridge is shutting down")]
    Shutdown,
}

/// A refused send; the caller's buffer is handed back
#[derive(Error)]
#[error("{kind}")]
pub struct SendError {
    kind: SendErrorKind,
    buffer: MessageBuffer,
}

impl SendError {
    pub(crate) fn new(kind: SendErrorKind, buffer: MessageBuffer) -> Self {
        Self { kind, buffer }
    }

    pub fn kind(&self) -> &SendErrorKind {
        &self.kind
    }

    pub fn into_buffer(self) -> MessageBuffer {
        self.buffer
    }
}

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("kind", &self.kind)
            .field("len", &self.buffer.len())
            .finish()
    }
}

/// Failures of the synchronous SVC send path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("SVC message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Short SVC write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("SVC control transfer failed: {0}")]
    Bus(#[from] BusError),

    #[error("Bridge is shutting down")]
    Shutdown,
}

/// Attach-time failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error(
        "Not enough endpoints found in device (svc-in: {svc_in}, cport-in: {cport_in}, cport-out: {cport_out})"
    )]
    MissingEndpoints {
        svc_in: bool,
        cport_in: bool,
        cport_out: bool,
    },

    #[error("Invalid bridge settings: {0}")]
    InvalidSettings(String),

    #[error("Failed to start receive requests: {0}")]
    Submit(BusError),

    #[error("Bridge {0} is already attached")]
    AlreadyAttached(BridgeId),

    #[error("Device error: {0}")]
    Device(String),
}

/// One attached ES2 bridge
pub struct Bridge {
    id: BridgeId,
    /// Unique per attach, even when a bus address is reused
    instance: u64,
    endpoints: Endpoints,
    settings: BridgeSettings,
    bus: Arc<dyn HostBus>,
    handler: Arc<dyn BridgeHandler>,
    pool: OutPool,
    /// Receive requests (CPort IN and SVC) currently owned by the bus
    rx_active: AtomicUsize,
    shutting_down: AtomicBool,
    disconnected: AtomicBool,
    events: Option<EventNotifier>,
    stats: BridgeStats,
}

impl Bridge {
    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Outbound requests currently in flight (pooled and overflow)
    pub fn sends_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Receive requests currently owned by the bus
    pub fn receives_in_flight(&self) -> usize {
        self.rx_active.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Handle one completion from the bus
    ///
    /// Runs in the dispatch context: never blocks and never holds the pool
    /// lock while calling into the handler or the bus.
    pub fn complete(&self, completion: Completion) {
        match completion.urb.id {
            UrbId::CportOut(slot) => self.complete_out(slot, completion),
            UrbId::CportIn(_) => self.complete_cport_in(completion),
            UrbId::SvcIn => self.complete_svc_in(completion),
        }
    }

    /// Handle every completion already queued; returns how many were handled
    pub fn drain(&self, completions: &CompletionReceiver) -> usize {
        let mut handled = 0;
        while let Some(completion) = completions.try_recv() {
            self.complete(completion);
            handled += 1;
        }
        handled
    }

    /// Report a fatal transfer status once; returns true for the first report
    fn raise_disconnect(&self, status: UrbStatus) -> bool {
        if self.is_shutting_down() || self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }

        error!("Bridge {} is gone ({})", self.id, status);
        if let Some(events) = &self.events
            && let Err(e) = events.notify(BridgeEvent::Disconnected {
                bridge: self.id,
                status,
            })
        {
            error!("Failed to send Disconnected event: {}", e);
        }
        true
    }

    /// Drop a receive request that will not be resubmitted
    fn retire_receive(&self, id: UrbId) {
        self.rx_active.fetch_sub(1, Ordering::AcqRel);
        self.stats.request_freed();
        self.stats.buffer_freed();
        debug!("Retired receive request {:?} on bridge {}", id, self.id);
    }
}

/// Feed completions to `bridge` until the queue closes
///
/// The only await point is the receive, so aborting the task never leaves a
/// completion half handled.
pub async fn run_dispatcher(bridge: Arc<Bridge>, completions: Arc<CompletionReceiver>) {
    debug!("Completion dispatcher started for bridge {}", bridge.id());
    while let Ok(completion) = completions.recv().await {
        bridge.complete(completion);
    }
    debug!("Completion dispatcher stopped for bridge {}", bridge.id());
}
