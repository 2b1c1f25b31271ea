//! Bridge attach and teardown

use super::pool::OutPool;
use super::stats::{BridgeStats, StatsSnapshot};
use super::{AttachError, Bridge, BridgeSettings};
use common::{
    BridgeHandler, BridgeId, CompletionReceiver, EndpointDescriptor, EndpointType, EventNotifier,
    HostBus, SubmitError, UrbId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long teardown waits for racing sends to reach the completion queue
const QUIESCE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Endpoint addresses used by a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Default control endpoint, used for SVC sends
    pub control: u8,
    /// Interrupt-in endpoint carrying SVC messages
    pub svc_in: u8,
    /// Polling interval of `svc_in`
    pub svc_interval: u8,
    /// Bulk-in endpoint carrying CPort frames
    pub cport_in: u8,
    /// Bulk-out endpoint carrying CPort frames
    pub cport_out: u8,
}

fn assign(slot: &mut Option<EndpointDescriptor>, desc: &EndpointDescriptor, role: &str) {
    match slot {
        None => *slot = Some(*desc),
        Some(first) => warn!(
            "Ignoring extra {} endpoint 0x{:02x}, already using 0x{:02x}",
            role, desc.address, first.address
        ),
    }
}

/// Pick the SVC and CPort endpoints out of the interface's descriptors
///
/// The first endpoint found for each role wins. Endpoints that fit no role
/// are logged and skipped.
pub fn discover_endpoints(descriptors: &[EndpointDescriptor]) -> Result<Endpoints, AttachError> {
    let mut svc_in = None;
    let mut cport_in = None;
    let mut cport_out = None;

    for desc in descriptors {
        match (desc.transfer_type, desc.is_in()) {
            (EndpointType::Interrupt, true) => assign(&mut svc_in, desc, "svc-in"),
            (EndpointType::Bulk, true) => assign(&mut cport_in, desc, "cport-in"),
            (EndpointType::Bulk, false) => assign(&mut cport_out, desc, "cport-out"),
            _ => warn!("Unknown endpoint type found, address 0x{:02x}", desc.address),
        }
    }

    match (svc_in, cport_in, cport_out) {
        (Some(svc), Some(cin), Some(cout)) => Ok(Endpoints {
            control: 0,
            svc_in: svc.address,
            svc_interval: svc.interval,
            cport_in: cin.address,
            cport_out: cout.address,
        }),
        (svc, cin, cout) => {
            error!("Not enough endpoints found in device, aborting!");
            Err(AttachError::MissingEndpoints {
                svc_in: svc.is_some(),
                cport_in: cin.is_some(),
                cport_out: cout.is_some(),
            })
        }
    }
}

fn validate_settings(settings: &BridgeSettings) -> Result<(), AttachError> {
    if settings.out_urbs == 0 || settings.out_urbs > u16::MAX as usize {
        return Err(AttachError::InvalidSettings(format!(
            "out_urbs must be between 1 and {}",
            u16::MAX
        )));
    }
    if settings.in_urbs == 0 || settings.in_urbs > u8::MAX as usize + 1 {
        return Err(AttachError::InvalidSettings(format!(
            "in_urbs must be between 1 and {}",
            u8::MAX as usize + 1
        )));
    }
    Ok(())
}

impl Bridge {
    /// Bring up the transport for one bridge
    ///
    /// Every receive request is submitted before this returns. On failure
    /// everything already started is torn down through [`Bridge::quiesce`]
    /// and nothing is left allocated.
    pub fn attach(
        id: BridgeId,
        descriptors: &[EndpointDescriptor],
        bus: Arc<dyn HostBus>,
        handler: Arc<dyn BridgeHandler>,
        settings: BridgeSettings,
        completions: &CompletionReceiver,
        events: Option<EventNotifier>,
    ) -> Result<Arc<Bridge>, AttachError> {
        validate_settings(&settings)?;
        let endpoints = discover_endpoints(descriptors)?;
        debug!("Bridge {} endpoints: {:?}", id, endpoints);

        let bridge = Arc::new(Bridge {
            id,
            instance: super::next_instance(),
            endpoints,
            pool: OutPool::new(settings.out_urbs, settings.max_overflow_urbs),
            settings,
            bus,
            handler,
            rx_active: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            events,
            stats: BridgeStats::new(),
        });

        // SVC request first, then the CPort receives
        let mut receives = Vec::with_capacity(bridge.settings.in_urbs + 1);
        receives.push(bridge.svc_in_urb());
        for index in 0..bridge.settings.in_urbs {
            receives.push(bridge.cport_in_urb(index as u8));
        }
        for _ in &receives {
            bridge.stats.request_allocated();
            bridge.stats.buffer_allocated();
        }
        bridge.stats.pool_created(bridge.pool.capacity() as u64);

        let mut pending = receives.into_iter();
        while let Some(urb) = pending.next() {
            bridge.rx_active.fetch_add(1, Ordering::AcqRel);
            if let Err(SubmitError { urb, error }) = bridge.bus.submit(urb) {
                error!("Can not submit {:?} for bridge {}: {}", urb.id, id, error);
                bridge.retire_receive(urb.id);
                for _ in pending {
                    bridge.stats.request_freed();
                    bridge.stats.buffer_freed();
                }
                bridge.quiesce(completions);
                return Err(AttachError::Submit(error));
            }
        }

        info!(
            "Bridge {} attached ({} out, {} in)",
            id,
            bridge.settings.out_urbs,
            bridge.settings.in_urbs
        );
        Ok(bridge)
    }

    /// Stop all traffic and release every request
    ///
    /// Runs in a fixed order: outstanding sends are killed and reported, then
    /// the CPort receives, then the SVC receive. Completions are handled from
    /// `completions` on the calling thread, so no dispatcher may be running.
    /// Safe to call more than once.
    pub fn quiesce(&self, completions: &CompletionReceiver) -> StatsSnapshot {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.drain(completions);
            return self.stats.snapshot();
        }
        debug!("Quiescing bridge {}", self.id);

        self.quiesce_sends(completions);

        for index in 0..self.settings.in_urbs {
            self.bus.kill(UrbId::CportIn(index as u8));
        }
        self.drain(completions);

        self.bus.kill(UrbId::SvcIn);
        self.drain(completions);

        let released = self.pool.retire();
        self.stats.pool_retired(released as u64);

        let snapshot = self.stats.snapshot();
        let receives = self.receives_in_flight();
        if snapshot.leaked_requests() > 0 || snapshot.leaked_buffers() > 0 || receives > 0 {
            warn!(
                "Bridge {} torn down with {} requests, {} buffers still allocated",
                self.id,
                snapshot.leaked_requests(),
                snapshot.leaked_buffers()
            );
        }
        info!("Bridge {} detached: {}", self.id, snapshot);
        snapshot
    }

    fn quiesce_sends(&self, completions: &CompletionReceiver) {
        let deadline = Instant::now() + QUIESCE_SEND_TIMEOUT;
        loop {
            for slot in self.pool.in_flight_slots() {
                self.bus.kill(UrbId::CportOut(slot));
            }
            self.drain(completions);

            let remaining = self.pool.in_flight();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                error!(
                    "Bridge {}: {} sends never completed during teardown",
                    self.id, remaining
                );
                return;
            }
            // A send that passed the shutdown check is still submitting
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        MOCK_CPORT_IN_ENDPOINT, MOCK_CPORT_OUT_ENDPOINT, MOCK_SVC_ENDPOINT, es2_endpoints,
    };

    fn endpoint(address: u8, transfer_type: EndpointType) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            transfer_type,
            interval: 0,
        }
    }

    #[test]
    fn test_discover_es2_layout() {
        let endpoints = discover_endpoints(&es2_endpoints()).unwrap();
        assert_eq!(endpoints.control, 0);
        assert_eq!(endpoints.svc_in, MOCK_SVC_ENDPOINT);
        assert_eq!(endpoints.svc_interval, 4);
        assert_eq!(endpoints.cport_in, MOCK_CPORT_IN_ENDPOINT);
        assert_eq!(endpoints.cport_out, MOCK_CPORT_OUT_ENDPOINT);
    }

    #[test]
    fn test_discover_order_independent() {
        let mut descriptors = es2_endpoints();
        descriptors.reverse();
        assert!(discover_endpoints(&descriptors).is_ok());
    }

    #[test]
    fn test_missing_bulk_out() {
        let descriptors = vec![
            endpoint(0x81, EndpointType::Interrupt),
            endpoint(0x82, EndpointType::Bulk),
        ];
        assert_eq!(
            discover_endpoints(&descriptors),
            Err(AttachError::MissingEndpoints {
                svc_in: true,
                cport_in: true,
                cport_out: false,
            })
        );
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut descriptors = es2_endpoints();
        descriptors.push(endpoint(0x84, EndpointType::Bulk));
        let endpoints = discover_endpoints(&descriptors).unwrap();
        assert_eq!(endpoints.cport_in, MOCK_CPORT_IN_ENDPOINT);
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let mut descriptors = vec![
            endpoint(0x83, EndpointType::Isochronous),
            endpoint(0x03, EndpointType::Interrupt),
        ];
        descriptors.extend(es2_endpoints());
        let endpoints = discover_endpoints(&descriptors).unwrap();
        assert_eq!(endpoints.svc_in, MOCK_SVC_ENDPOINT);
    }

    #[test]
    fn test_validate_settings() {
        assert!(validate_settings(&BridgeSettings::default()).is_ok());

        let zero_out = BridgeSettings {
            out_urbs: 0,
            ..Default::default()
        };
        assert!(matches!(
            validate_settings(&zero_out),
            Err(AttachError::InvalidSettings(_))
        ));

        let too_many_in = BridgeSettings {
            in_urbs: 300,
            ..Default::default()
        };
        assert!(validate_settings(&too_many_in).is_err());
    }
}
