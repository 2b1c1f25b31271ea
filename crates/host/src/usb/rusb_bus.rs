//! [`HostBus`] over blocking rusb calls
//!
//! libusb's synchronous API is driven from one worker thread per endpoint.
//! Submitted requests queue on their endpoint's worker and run one at a
//! time; each finished request is posted to the completion queue.
//!
//! IN transfers poll in short slices so a kill or shutdown is noticed
//! between slices. OUT transfers run to completion or their timeout.

use common::{
    BusError, Completion, CompletionSender, ControlSetup, HostBus, SubmitError, TransferKind, Urb,
    UrbId, UrbStatus,
};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Poll slice for IN transfers
const IN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Bulk-out timeout when none is configured
pub const DEFAULT_BULK_OUT_TIMEOUT: Duration = Duration::from_secs(1);

enum Entry {
    /// Waiting for its endpoint worker
    Queued(Urb),
    /// Owned by the worker
    Active { cancelled: bool },
}

/// Requests owned by the bus, from submit until their completion is posted
struct RequestTable {
    completions: CompletionSender,
    entries: Mutex<HashMap<UrbId, Entry>>,
    /// Signalled whenever a request leaves `entries`
    idle: Condvar,
}

impl RequestTable {
    fn new(completions: CompletionSender) -> Self {
        Self {
            completions,
            entries: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<UrbId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Post with the entries lock held, so kill() sees the completion
    /// queued by the time the entry disappears
    fn post_locked(&self, completion: Completion) {
        if let Err(rejected) = self.completions.post(completion) {
            if self.completions.is_closed() {
                debug!("Completion for {:?} dropped, queue closed", rejected.urb.id);
            } else {
                error!("Completion queue full, dropping {:?}", rejected.urb.id);
            }
        }
    }

    fn queue(&self, urb: Urb) -> Result<(), SubmitError> {
        let mut entries = self.entries();
        if entries.contains_key(&urb.id) {
            return Err(SubmitError {
                urb,
                error: BusError::InvalidParam,
            });
        }
        entries.insert(urb.id, Entry::Queued(urb));
        Ok(())
    }

    /// Take back a request that never reached its worker
    fn withdraw(&self, id: UrbId) -> Option<Urb> {
        let mut entries = self.entries();
        match entries.remove(&id) {
            Some(Entry::Queued(urb)) => Some(urb),
            Some(active) => {
                entries.insert(id, active);
                None
            }
            None => None,
        }
    }

    /// Hand a queued request to its worker
    fn start(&self, id: UrbId) -> Option<Urb> {
        let mut entries = self.entries();
        match entries.remove(&id) {
            Some(Entry::Queued(urb)) => {
                entries.insert(id, Entry::Active { cancelled: false });
                Some(urb)
            }
            Some(active) => {
                entries.insert(id, active);
                None
            }
            // Unlinked while queued
            None => None,
        }
    }

    fn is_cancelled(&self, id: UrbId) -> bool {
        matches!(
            self.entries().get(&id),
            Some(Entry::Active { cancelled: true })
        )
    }

    fn finish(&self, completion: Completion) {
        {
            let mut entries = self.entries();
            entries.remove(&completion.urb.id);
            self.post_locked(completion);
        }
        self.idle.notify_all();
    }

    /// Cancel without waiting; returns the lock for kill() to wait on
    fn unlink_locked(&self, id: UrbId) -> MutexGuard<'_, HashMap<UrbId, Entry>> {
        let mut entries = self.entries();
        match entries.get_mut(&id) {
            Some(Entry::Active { cancelled }) => *cancelled = true,
            Some(Entry::Queued(_)) => {
                if let Some(Entry::Queued(urb)) = entries.remove(&id) {
                    self.post_locked(Completion {
                        urb,
                        status: UrbStatus::Cancelled,
                        actual_length: 0,
                    });
                }
            }
            None => {}
        }
        entries
    }

    fn unlink(&self, id: UrbId) {
        drop(self.unlink_locked(id));
    }

    fn kill(&self, id: UrbId) {
        let mut entries = self.unlink_locked(id);
        while entries.contains_key(&id) {
            entries = self.idle.wait(entries).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct Shared {
    handle: DeviceHandle<Context>,
    requests: RequestTable,
    closing: AtomicBool,
    bulk_out_timeout: Duration,
}

impl Shared {
    fn should_stop(&self, id: UrbId) -> bool {
        self.closing.load(Ordering::Acquire) || self.requests.is_cancelled(id)
    }

    fn run(&self, mut urb: Urb) -> Completion {
        let id = urb.id;
        let endpoint = urb.endpoint;

        if urb.is_in() {
            loop {
                if self.should_stop(id) {
                    return Completion {
                        urb,
                        status: UrbStatus::Cancelled,
                        actual_length: 0,
                    };
                }

                let result = match urb.kind {
                    TransferKind::Bulk => {
                        self.handle
                            .read_bulk(endpoint, urb.transfer_mut(), IN_POLL_TIMEOUT)
                    }
                    TransferKind::Interrupt { .. } => {
                        self.handle
                            .read_interrupt(endpoint, urb.transfer_mut(), IN_POLL_TIMEOUT)
                    }
                };

                match result {
                    Ok(len) => {
                        return Completion {
                            urb,
                            status: UrbStatus::Completed,
                            actual_length: len,
                        };
                    }
                    Err(rusb::Error::Timeout) => continue,
                    Err(e) => {
                        debug!("IN transfer on {:#x} failed: {}", endpoint, e);
                        return Completion {
                            urb,
                            status: map_rusb_status(e),
                            actual_length: 0,
                        };
                    }
                }
            }
        }

        if self.should_stop(id) {
            return Completion {
                urb,
                status: UrbStatus::Cancelled,
                actual_length: 0,
            };
        }

        // libusb's synchronous API cannot abort a write once started; an
        // unlink that arrives now takes effect when the write returns
        let result = match urb.kind {
            TransferKind::Bulk => {
                self.handle
                    .write_bulk(endpoint, urb.transfer(), self.bulk_out_timeout)
            }
            TransferKind::Interrupt { .. } => {
                self.handle
                    .write_interrupt(endpoint, urb.transfer(), self.bulk_out_timeout)
            }
        };

        match result {
            Ok(len) => Completion {
                urb,
                status: UrbStatus::Completed,
                actual_length: len,
            },
            Err(e) => {
                warn!("OUT transfer on {:#x} failed: {}", endpoint, e);
                Completion {
                    urb,
                    status: map_rusb_status(e),
                    actual_length: 0,
                }
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, jobs: async_channel::Receiver<UrbId>) {
    while let Ok(id) = jobs.recv_blocking() {
        let Some(urb) = shared.requests.start(id) else {
            continue;
        };
        let completion = shared.run(urb);
        shared.requests.finish(completion);
    }
}

struct Worker {
    jobs: async_channel::Sender<UrbId>,
    thread: Option<JoinHandle<()>>,
}

/// Asynchronous request contract on top of a claimed rusb handle
pub struct RusbBus {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<u8, Worker>>,
    interface: u8,
    reattach_kernel_driver: bool,
}

impl RusbBus {
    pub fn new(
        handle: DeviceHandle<Context>,
        interface: u8,
        reattach_kernel_driver: bool,
        completions: CompletionSender,
        bulk_out_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle,
                requests: RequestTable::new(completions),
                closing: AtomicBool::new(false),
                bulk_out_timeout: bulk_out_timeout.unwrap_or(DEFAULT_BULK_OUT_TIMEOUT),
            }),
            workers: Mutex::new(HashMap::new()),
            interface,
            reattach_kernel_driver,
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<u8, Worker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Job queue of `endpoint`'s worker, starting the worker on first use
    fn jobs_for(&self, endpoint: u8) -> Result<async_channel::Sender<UrbId>, BusError> {
        let mut workers = self.workers();
        if let Some(worker) = workers.get(&endpoint) {
            return Ok(worker.jobs.clone());
        }

        let (tx, rx) = async_channel::unbounded();
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("usb-ep{:02x}", endpoint))
            .spawn(move || worker_loop(shared, rx))
            .map_err(|e| BusError::Io(format!("Failed to spawn endpoint worker: {}", e)))?;

        debug!("Started worker for endpoint {:#x}", endpoint);
        workers.insert(
            endpoint,
            Worker {
                jobs: tx.clone(),
                thread: Some(thread),
            },
        );
        Ok(tx)
    }
}

impl HostBus for RusbBus {
    fn submit(&self, urb: Urb) -> Result<(), SubmitError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(SubmitError {
                urb,
                error: BusError::Shutdown,
            });
        }

        let jobs = match self.jobs_for(urb.endpoint) {
            Ok(jobs) => jobs,
            Err(error) => return Err(SubmitError { urb, error }),
        };

        let id = urb.id;
        self.shared.requests.queue(urb)?;

        if jobs.try_send(id).is_err()
            && let Some(urb) = self.shared.requests.withdraw(id)
        {
            return Err(SubmitError {
                urb,
                error: BusError::Shutdown,
            });
        }
        Ok(())
    }

    fn unlink(&self, id: UrbId) {
        self.shared.requests.unlink(id);
    }

    fn kill(&self, id: UrbId) {
        self.shared.requests.kill(id);
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, BusError> {
        self.shared
            .handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
            .map_err(map_bus_error)
    }
}

impl Drop for RusbBus {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);

        let workers: Vec<Worker> = self.workers().drain().map(|(_, w)| w).collect();
        for mut worker in workers {
            worker.jobs.close();
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                error!("USB endpoint worker panicked");
            }
        }

        if let Err(e) = self.shared.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.reattach_kernel_driver
            && let Err(e) = self.shared.handle.attach_kernel_driver(self.interface)
        {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                self.interface, e
            );
        }
    }
}

/// Map a failed rusb transfer to a request status
pub fn map_rusb_status(err: rusb::Error) -> UrbStatus {
    match err {
        rusb::Error::Timeout => UrbStatus::TimedOut,
        rusb::Error::Pipe => UrbStatus::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => UrbStatus::NoDevice,
        rusb::Error::Overflow => UrbStatus::Overflow,
        rusb::Error::Io => UrbStatus::Proto,
        // EINTR: the transfer may simply be retried
        rusb::Error::Interrupted => UrbStatus::Other(-4),
        rusb::Error::InvalidParam => UrbStatus::Other(-2),
        rusb::Error::Access => UrbStatus::Other(-3),
        rusb::Error::Busy => UrbStatus::Other(-6),
        rusb::Error::NoMem => UrbStatus::Other(-11),
        rusb::Error::NotSupported => UrbStatus::Other(-12),
        _ => UrbStatus::Other(-99),
    }
}

/// Map a failed synchronous rusb call to a bus error
pub fn map_bus_error(err: rusb::Error) -> BusError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => BusError::NoDevice,
        rusb::Error::Pipe => BusError::Pipe,
        rusb::Error::Timeout => BusError::Timeout,
        rusb::Error::InvalidParam => BusError::InvalidParam,
        _ => BusError::Io(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{StatusClass, classify};

    #[test]
    fn test_map_rusb_status() {
        assert_eq!(map_rusb_status(rusb::Error::Timeout), UrbStatus::TimedOut);
        assert_eq!(map_rusb_status(rusb::Error::Pipe), UrbStatus::Stall);
        assert_eq!(map_rusb_status(rusb::Error::NoDevice), UrbStatus::NoDevice);
        assert_eq!(map_rusb_status(rusb::Error::Overflow), UrbStatus::Overflow);
    }

    #[test]
    fn test_unplug_is_fatal() {
        assert_eq!(
            classify(map_rusb_status(rusb::Error::NoDevice)),
            StatusClass::Fatal
        );
        assert_eq!(
            classify(map_rusb_status(rusb::Error::Io)),
            StatusClass::Transient
        );
        assert_eq!(
            classify(map_rusb_status(rusb::Error::Busy)),
            StatusClass::Unknown
        );
    }

    #[test]
    fn test_interrupted_transfer_is_not_fatal() {
        let class = classify(map_rusb_status(rusb::Error::Interrupted));
        assert_ne!(class, StatusClass::Fatal);
        assert!(class.resubmits());
    }

    #[test]
    fn test_map_bus_error() {
        assert_eq!(map_bus_error(rusb::Error::NoDevice), BusError::NoDevice);
        assert_eq!(map_bus_error(rusb::Error::Pipe), BusError::Pipe);
        assert_eq!(map_bus_error(rusb::Error::Timeout), BusError::Timeout);
        assert!(matches!(map_bus_error(rusb::Error::Busy), BusError::Io(_)));
    }

    fn queued_urb(index: u8) -> Urb {
        Urb {
            id: UrbId::CportIn(index),
            endpoint: 0x82,
            kind: TransferKind::Bulk,
            buffer: vec![0u8; 16],
            offset: 0,
        }
    }

    fn table() -> (Arc<RequestTable>, common::CompletionReceiver) {
        let (tx, rx) = common::create_completion_queue(16);
        (Arc::new(RequestTable::new(tx)), rx)
    }

    fn done(urb: Urb) -> Completion {
        Completion {
            urb,
            status: UrbStatus::Completed,
            actual_length: 0,
        }
    }

    #[test]
    fn test_unlink_queued_request_posts_at_once() {
        let (requests, rx) = table();
        requests.queue(queued_urb(0)).unwrap();

        requests.unlink(UrbId::CportIn(0));
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status, UrbStatus::Cancelled);

        // The worker finds nothing to run
        assert!(requests.start(UrbId::CportIn(0)).is_none());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_unlink_active_request_does_not_wait() {
        let (requests, rx) = table();
        requests.queue(queued_urb(1)).unwrap();
        let urb = requests.start(UrbId::CportIn(1)).unwrap();

        requests.unlink(UrbId::CportIn(1));
        assert!(requests.is_cancelled(UrbId::CportIn(1)));
        assert!(rx.try_recv().is_none());

        requests.finish(done(urb));
        assert_eq!(rx.try_recv().unwrap().status, UrbStatus::Completed);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_kill_waits_for_active_request() {
        let (requests, rx) = table();
        requests.queue(queued_urb(2)).unwrap();
        let urb = requests.start(UrbId::CportIn(2)).unwrap();

        let killer = {
            let requests = requests.clone();
            std::thread::spawn(move || requests.kill(UrbId::CportIn(2)))
        };

        // Wait for the cancel flag so the killer is parked on the condvar
        while !requests.is_cancelled(UrbId::CportIn(2)) {
            std::thread::yield_now();
        }
        assert!(!killer.is_finished());

        requests.finish(done(urb));
        killer.join().unwrap();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_kill_unknown_request_returns() {
        let (requests, rx) = table();
        requests.kill(UrbId::SvcIn);
        requests.unlink(UrbId::SvcIn);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_duplicate_request_is_refused() {
        let (requests, _rx) = table();
        requests.queue(queued_urb(3)).unwrap();

        let err = requests.queue(queued_urb(3)).unwrap_err();
        assert_eq!(err.error, BusError::InvalidParam);
        assert_eq!(err.urb.id, UrbId::CportIn(3));

        assert!(requests.withdraw(UrbId::CportIn(3)).is_some());
        assert!(requests.queue(queued_urb(3)).is_ok());
    }
}
