//! Attached bridges, keyed by bus position
//!
//! The registry owns each bridge together with its completion queue and the
//! dispatcher task draining it. Detaching stops the dispatcher first, then
//! quiesces the bridge on a blocking thread so the bus may wait for killed
//! requests.

use crate::bridge::{AttachError, Bridge, BridgeSettings, StatsSnapshot, run_dispatcher};
use common::{
    BridgeEvents, BridgeHandler, BridgeId, CompletionReceiver, CompletionSender,
    EndpointDescriptor, EventNotifier, HostBus, create_completion_queue, create_event_channel,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct AttachedBridge {
    bridge: Arc<Bridge>,
    completions: Arc<CompletionReceiver>,
    dispatcher: JoinHandle<()>,
}

/// Every bridge currently attached to this host
pub struct HostRegistry {
    bridges: HashMap<BridgeId, AttachedBridge>,
    notifier: EventNotifier,
    events: BridgeEvents,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        let (notifier, events) = create_event_channel();
        Self {
            bridges: HashMap::new(),
            notifier,
            events,
        }
    }

    /// Events raised by any attached bridge
    pub fn events(&self) -> BridgeEvents {
        self.events.clone()
    }

    /// Attach a bridge and start dispatching its completions
    ///
    /// `make_bus` receives the sending side of the bridge's completion queue.
    /// Must be called from within a Tokio runtime.
    pub fn attach<F>(
        &mut self,
        id: BridgeId,
        descriptors: &[EndpointDescriptor],
        settings: BridgeSettings,
        queue_depth: usize,
        handler: Arc<dyn BridgeHandler>,
        make_bus: F,
    ) -> Result<Arc<Bridge>, AttachError>
    where
        F: FnOnce(CompletionSender) -> Arc<dyn HostBus>,
    {
        if self.bridges.contains_key(&id) {
            return Err(AttachError::AlreadyAttached(id));
        }

        let depth = queue_depth.max(settings.completion_queue_depth());
        let (tx, rx) = create_completion_queue(depth);
        let bus = make_bus(tx);

        let bridge = Bridge::attach(
            id,
            descriptors,
            bus,
            handler,
            settings,
            &rx,
            Some(self.notifier.clone()),
        )?;

        let completions = Arc::new(rx);
        let dispatcher = tokio::spawn(run_dispatcher(bridge.clone(), completions.clone()));

        self.bridges.insert(
            id,
            AttachedBridge {
                bridge: bridge.clone(),
                completions,
                dispatcher,
            },
        );
        info!("Registered bridge {}", id);
        Ok(bridge)
    }

    pub fn get(&self, id: BridgeId) -> Option<Arc<Bridge>> {
        self.bridges.get(&id).map(|b| b.bridge.clone())
    }

    pub fn ids(&self) -> Vec<BridgeId> {
        let mut ids: Vec<BridgeId> = self.bridges.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Tear down one bridge; returns its final statistics
    pub async fn detach(&mut self, id: BridgeId) -> Option<StatsSnapshot> {
        let attached = self.bridges.remove(&id)?;
        debug!("Detaching bridge {}", id);

        attached.dispatcher.abort();
        if let Err(e) = attached.dispatcher.await
            && !e.is_cancelled()
        {
            error!("Completion dispatcher for bridge {} failed: {}", id, e);
        }

        let bridge = attached.bridge;
        let completions = attached.completions;
        match tokio::task::spawn_blocking(move || bridge.quiesce(&completions)).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("Teardown of bridge {} failed: {}", id, e);
                None
            }
        }
    }

    /// Tear down every bridge
    pub async fn detach_all(&mut self) {
        for id in self.ids() {
            self.detach(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockBus, RecordingHandler, es2_endpoints, with_timeout,
    };
    use common::{BridgeEvent, UrbStatus};
    use protocol::{CportId, MessageBuffer};
    use std::time::Duration;

    const ID: BridgeId = BridgeId { bus: 1, address: 7 };

    fn attach_mock(
        registry: &mut HostRegistry,
        handler: Arc<RecordingHandler>,
    ) -> (Arc<Bridge>, Arc<MockBus>) {
        let mut mock = None;
        let bridge = registry
            .attach(
                ID,
                &es2_endpoints(),
                BridgeSettings::default(),
                0,
                handler,
                |tx| {
                    let bus = Arc::new(MockBus::new(tx));
                    mock = Some(bus.clone());
                    bus as Arc<dyn HostBus>
                },
            )
            .unwrap();
        (bridge, mock.unwrap())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_frames() {
        let mut registry = HostRegistry::new();
        let handler = Arc::new(RecordingHandler::new());
        let (_bridge, bus) = attach_mock(&mut registry, handler.clone());

        assert!(bus.deliver_cport_frame(&[9, 1, 2, 3]));
        wait_for(|| !handler.received().is_empty()).await;
        assert_eq!(handler.received(), vec![(CportId(9), vec![1, 2, 3])]);

        registry.detach_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_attach_rejected() {
        let mut registry = HostRegistry::new();
        let handler = Arc::new(RecordingHandler::new());
        let _attached = attach_mock(&mut registry, handler.clone());

        let result = registry.attach(
            ID,
            &es2_endpoints(),
            BridgeSettings::default(),
            0,
            handler,
            |tx| Arc::new(MockBus::new(tx)) as Arc<dyn HostBus>,
        );
        assert!(matches!(result, Err(AttachError::AlreadyAttached(id)) if id == ID));

        registry.detach_all().await;
    }

    #[tokio::test]
    async fn test_detach_reports_outstanding_sends() {
        let mut registry = HostRegistry::new();
        let handler = Arc::new(RecordingHandler::new());
        let (bridge, bus) = attach_mock(&mut registry, handler.clone());

        let buffer = MessageBuffer::from_payload(b"pending").unwrap();
        bridge.send(CportId(2), buffer).unwrap();

        let snapshot = registry.detach(ID).await.unwrap();
        assert_eq!(
            handler.sent(),
            vec![(b"pending".to_vec(), UrbStatus::Cancelled)]
        );
        assert_eq!(snapshot.leaked_requests(), 0);
        assert_eq!(snapshot.leaked_buffers(), 0);
        assert_eq!(bus.in_flight(), 0);
        assert!(registry.get(ID).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_event() {
        let mut registry = HostRegistry::new();
        let events = registry.events();
        let handler = Arc::new(RecordingHandler::new());
        let (_bridge, bus) = attach_mock(&mut registry, handler);

        assert!(bus.fail_svc(UrbStatus::NoDevice));
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BridgeEvent::Disconnected {
                bridge: ID,
                status: UrbStatus::NoDevice
            }
        );

        registry.detach(ID).await;
    }
}
