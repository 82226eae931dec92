//! The per-session protocol engine.
//!
//! A [`Node`] lives for one session and is shared by the event loop, the
//! heartbeat timer, any pending start, and the public API. It owns the clock
//! synchronizer, the dispatcher and (on a commander) the membership tracker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::capture::CaptureLayer;
use crate::clock::ClockSync;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::error::Result;
use crate::identity::{NodeId, Role};
use crate::membership::{DeviceRecord, DeviceStatus, MembershipTracker};
use crate::protocol::{ControlMessage, MessageKind, Payload};
use crate::transport::{ConnectionId, ConnectionSet, LinkEvent, ProtocolHint};
use crate::trigger::{self, PendingStart};

use super::events::NodeEvent;

/// What a node says about itself.
#[derive(Debug, Clone)]
pub(crate) struct Profile {
    pub(crate) id: NodeId,
    pub(crate) hint: ProtocolHint,
    pub(crate) display_name: String,
    pub(crate) lens_label: String,
    pub(crate) lead_ms: u64,
}

#[derive(Debug)]
pub(crate) struct Node {
    profile: Profile,
    role: Role,
    sync: ClockSync,
    dispatcher: Dispatcher,
    membership: Mutex<MembershipTracker>,
    peers: Option<ConnectionSet>,
    pending: PendingStart,
    capture: Arc<dyn CaptureLayer>,
    events: broadcast::Sender<NodeEvent>,
    active: AtomicBool,
}

impl Node {
    pub(crate) fn commander(
        profile: Profile,
        sync: ClockSync,
        dispatcher: Dispatcher,
        peers: ConnectionSet,
        liveness_timeout_ms: i64,
        capture: Arc<dyn CaptureLayer>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            profile,
            role: Role::Commander,
            sync,
            dispatcher,
            membership: Mutex::new(MembershipTracker::new(liveness_timeout_ms)),
            peers: Some(peers),
            pending: PendingStart::new(),
            capture,
            events,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn field(
        profile: Profile,
        sync: ClockSync,
        dispatcher: Dispatcher,
        capture: Arc<dyn CaptureLayer>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            profile,
            role: Role::FieldNode,
            sync,
            dispatcher,
            membership: Mutex::new(MembershipTracker::default()),
            peers: None,
            pending: PendingStart::new(),
            capture,
            events,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn hint(&self) -> ProtocolHint {
        self.profile.hint
    }

    pub(crate) fn lead_ms(&self) -> u64 {
        self.profile.lead_ms
    }

    pub(crate) fn sync(&self) -> &ClockSync {
        &self.sync
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn devices(&self) -> Vec<DeviceRecord> {
        self.tracker().snapshot()
    }

    fn tracker(&self) -> MutexGuard<'_, MembershipTracker> {
        self.membership
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn local_status(&self) -> DeviceStatus {
        if self.capture.is_locally_recording() {
            DeviceStatus::Recording
        } else {
            DeviceStatus::Online
        }
    }

    pub(crate) fn device_payload(&self, status: DeviceStatus) -> Payload {
        Payload::device(&self.profile.display_name, status, &self.profile.lens_label)
            .with_protocol(self.profile.hint)
    }

    /// Dispatch unless the session has been torn down.
    pub(crate) async fn dispatch(&self, kind: MessageKind, payload: Option<Payload>) -> Option<Dispatched> {
        if !self.is_active() {
            debug!(%kind, "Session inactive, not dispatching");
            return None;
        }
        Some(self.dispatcher.dispatch(kind, payload).await)
    }

    /// Stop processing and cancel any pending start.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.pending.cancel();
    }

    /// Announce departure to the commander and give the writer time to send it.
    pub(crate) async fn leave(&self, limit: Duration) {
        if self.role != Role::FieldNode || !self.is_active() {
            return;
        }
        self.dispatcher
            .dispatch(MessageKind::Telemetry, Some(self.device_payload(DeviceStatus::Offline)))
            .await;
        if !self.dispatcher.flush(limit).await {
            debug!("Commander link did not drain before teardown");
        }
    }

    pub(crate) async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Message(inbound) => {
                if inbound.message.sender_id == self.profile.id {
                    trace!(kind = %inbound.message.kind, "Ignoring own message");
                    return;
                }
                self.handle(inbound.message, inbound.received_at, Some(inbound.connection))
                    .await;
            }
            LinkEvent::Closed(id) => match &self.peers {
                Some(peers) => {
                    if peers.remove(id).await.is_some() {
                        debug!(connection = %id, "Dropped closed field link");
                    }
                }
                None => warn!("Lost connection to commander"),
            },
        }
    }

    /// Handle one message, remote or looped back.
    pub(crate) async fn handle(
        self: &Arc<Self>,
        message: ControlMessage,
        received_at: i64,
        from: Option<ConnectionId>,
    ) {
        if !self.is_active() {
            trace!(kind = %message.kind, "Session inactive, message dropped");
            return;
        }
        let kind = message.kind;

        if self.role == Role::FieldNode && kind.is_clock_sample() {
            self.sync.on_sync_sample(message.timestamp, received_at);
        }

        if self.role == Role::Commander {
            self.track(&message, received_at);
            if kind == MessageKind::Handshake {
                if let Some(connection) = from {
                    self.reply_sync(connection).await;
                }
            }
        }

        // A commander obeys only the triggers it issued itself, via loopback
        if kind.is_trigger() && self.role == Role::Commander && from.is_some() {
            warn!(%kind, sender = %message.sender_id, "Ignoring trigger from field node");
        } else {
            match kind {
                MessageKind::StartRecording => self.schedule_start(&message),
                MessageKind::StopRecording => {
                    self.pending.cancel();
                    if let Err(e) = self.end_recording().await {
                        warn!(capture = self.capture.name(), error = %e, "Local stop failed");
                    }
                }
                _ => {}
            }
        }

        self.emit(NodeEvent::Message(message));
    }

    fn track(&self, message: &ControlMessage, received_at: i64) {
        let snapshot = {
            let mut tracker = self.tracker();
            let changed = if message.kind.refreshes_membership() {
                tracker.observe(message, received_at)
            } else if message.kind == MessageKind::PreviewFrame {
                message
                    .payload
                    .as_ref()
                    .and_then(|p| p.preview_image.clone())
                    .is_some_and(|image| tracker.record_preview(&message.sender_id, image))
            } else {
                false
            };
            changed.then(|| tracker.snapshot())
        };
        if let Some(devices) = snapshot {
            self.emit(NodeEvent::MembershipChanged(devices));
        }
    }

    async fn reply_sync(&self, connection: ConnectionId) {
        let Some(peers) = &self.peers else {
            return;
        };
        let Some(link) = peers.get(connection).await else {
            return;
        };
        match self.dispatcher.reply(&link, MessageKind::Sync, None) {
            Ok(_) => trace!(%connection, "Sent sync to new field node"),
            Err(e) => {
                warn!(%connection, error = %e, "Pruning dead connection");
                peers.remove(connection).await;
            }
        }
    }

    fn schedule_start(self: &Arc<Self>, message: &ControlMessage) {
        if self.capture.is_locally_recording() {
            debug!("Already recording, start ignored");
            return;
        }
        let delay = message.delay_ms().unwrap_or(self.profile.lead_ms);
        let sync_now = self.sync.synchronized_now();
        let wait = trigger::wait_ms(message.timestamp, delay, sync_now);
        info!(
            wait_ms = wait,
            fire_at = trigger::fire_at(message.timestamp, delay),
            offset_ms = self.sync.offset_ms(),
            "Start scheduled"
        );

        let node = Arc::clone(self);
        self.pending
            .schedule(Duration::from_millis(wait), async move {
                if let Err(e) = node.begin_recording().await {
                    warn!(capture = node.capture.name(), error = %e, "Deferred start failed");
                }
            });
    }

    pub(crate) async fn begin_recording(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        if self.capture.is_locally_recording() {
            debug!("Already recording, start ignored");
            return Ok(());
        }
        self.capture.begin_local_recording().await?;
        let at = self.sync.synchronized_now();
        info!(at, "Local recording started");
        self.emit(NodeEvent::Recording {
            recording: true,
            at,
        });
        self.report_status(DeviceStatus::Recording).await;
        Ok(())
    }

    pub(crate) async fn end_recording(&self) -> Result<()> {
        if !self.capture.is_locally_recording() {
            trace!("Not recording, stop ignored");
            return Ok(());
        }
        self.capture.end_local_recording().await?;
        let at = self.sync.synchronized_now();
        info!(at, "Local recording stopped");
        self.emit(NodeEvent::Recording {
            recording: false,
            at,
        });
        self.report_status(DeviceStatus::Online).await;
        Ok(())
    }

    async fn report_status(&self, status: DeviceStatus) {
        if self.role == Role::FieldNode {
            self.dispatch(MessageKind::Telemetry, Some(self.device_payload(status)))
                .await;
        }
    }

    /// One heartbeat period: the commander broadcasts its clock and sweeps
    /// membership, a field node reports in.
    pub(crate) async fn on_tick(&self) {
        match self.role {
            Role::Commander => {
                self.dispatch(MessageKind::Sync, None).await;
                let now = self.sync.local_now();
                let snapshot = {
                    let mut tracker = self.tracker();
                    let evicted = tracker.sweep(now);
                    (!evicted.is_empty()).then(|| tracker.snapshot())
                };
                if let Some(devices) = snapshot {
                    self.emit(NodeEvent::MembershipChanged(devices));
                }
            }
            Role::FieldNode => {
                let payload = self.device_payload(self.local_status());
                self.dispatch(MessageKind::Heartbeat, Some(payload)).await;
            }
        }
    }
}

/// Route link events and looped-back messages into the node until both
/// sources close.
pub(crate) async fn run_event_loop(
    node: Arc<Node>,
    mut links: mpsc::Receiver<LinkEvent>,
    mut loopback: mpsc::UnboundedReceiver<ControlMessage>,
) {
    loop {
        tokio::select! {
            Some(event) = links.recv() => node.handle_link_event(event).await,
            Some(message) = loopback.recv() => {
                let received_at = node.sync().local_now();
                node.handle(message, received_at, None).await;
            }
            else => break,
        }
    }
    debug!("Event loop finished");
}

/// Fire [`Node::on_tick`] every `period`, starting one period from now.
pub(crate) async fn run_timer(node: Arc<Node>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !node.is_active() {
            break;
        }
        node.on_tick().await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::capture::{CaptureError, LoggingCapture};
    use crate::clock::{Clock, TokioClock};
    use crate::transport::{Connection, Inbound};

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn profile(id: &str) -> Profile {
        Profile {
            id: NodeId::from(id),
            hint: ProtocolHint::Fast,
            display_name: format!("{id} cam"),
            lens_label: "1x".to_string(),
            lead_ms: 500,
        }
    }

    struct FieldHarness {
        node: Arc<Node>,
        capture: LoggingCapture,
        upstream: mpsc::Receiver<ControlMessage>,
        events: broadcast::Receiver<NodeEvent>,
    }

    fn field(id: &str, clock: Arc<dyn Clock>) -> FieldHarness {
        let (upstream_conn, upstream) = Connection::channel(peer(), 16);
        let capture = LoggingCapture::new(Arc::clone(&clock));
        let (events_tx, events) = broadcast::channel(64);
        let node = Arc::new(Node::field(
            profile(id),
            ClockSync::follower(Arc::clone(&clock)),
            Dispatcher::field(NodeId::from(id), clock, upstream_conn),
            Arc::new(capture.clone()),
            events_tx,
        ));
        FieldHarness {
            node,
            capture,
            upstream,
            events,
        }
    }

    struct CommanderHarness {
        node: Arc<Node>,
        capture: LoggingCapture,
        peers: ConnectionSet,
        loopback: mpsc::UnboundedReceiver<ControlMessage>,
    }

    fn commander(clock: Arc<dyn Clock>) -> CommanderHarness {
        let peers = ConnectionSet::new();
        let (loop_tx, loopback) = mpsc::unbounded_channel();
        let capture = LoggingCapture::new(Arc::clone(&clock));
        let (events_tx, _) = broadcast::channel(64);
        let node = Arc::new(Node::commander(
            profile("cmd"),
            ClockSync::reference(Arc::clone(&clock)),
            Dispatcher::commander(NodeId::from("cmd"), Arc::clone(&clock), peers.clone(), loop_tx),
            peers.clone(),
            15_000,
            Arc::new(capture.clone()),
            events_tx,
        ));
        CommanderHarness {
            node,
            capture,
            peers,
            loopback,
        }
    }

    fn message(kind: MessageKind, sender: &str, timestamp: i64, payload: Option<Payload>) -> ControlMessage {
        ControlMessage::new(kind, NodeId::from(sender), timestamp, payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_begins_at_origin_plus_delay() {
        // Commander clock reads 10_000 when it sends; it arrives here 80 ms
        // later, and this node's clock runs 2_000 ms ahead of the commander's
        let base = TokioClock::new(10_000);
        let h = field("a", Arc::new(base.skewed(2_000)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let receipt = 12_080;
        h.node
            .handle(message(MessageKind::Sync, "cmd", 10_000, None), receipt, None)
            .await;
        assert_eq!(h.node.sync().offset_ms(), 2_080);

        // Start stamped at commander time 10_000 with a 500 ms lead
        h.node
            .handle(
                message(MessageKind::StartRecording, "cmd", 10_000, Some(Payload::start(500))),
                receipt,
                None,
            )
            .await;
        assert!(h.node.pending.is_pending());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let starts = h.capture.starts();
        assert_eq!(starts.len(), 1);
        // Local clock at fire is sync target + offset
        assert_eq!(starts[0] - h.node.sync().offset_ms(), 10_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_error_becomes_skew() {
        // T0 = 0, D = 500. A is exact and handles the start at 50; B's
        // synchronized clock reads 100 ms ahead at the same instant
        let base = TokioClock::new(0);
        let a = field("a", Arc::new(base));
        let b = field("b", Arc::new(base.skewed(100)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = message(MessageKind::StartRecording, "cmd", 0, Some(Payload::start(500)));
        assert_eq!(trigger::wait_ms(0, 500, a.node.sync().synchronized_now()), 450);
        assert_eq!(trigger::wait_ms(0, 500, b.node.sync().synchronized_now()), 350);

        a.node.handle(start.clone(), 50, None).await;
        b.node.handle(start, 150, None).await;

        tokio::time::sleep(Duration::from_millis(349)).await;
        assert!(b.capture.starts().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(b.capture.starts().len(), 1);
        assert!(a.capture.starts().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.capture.starts().len(), 1);

        // Both started at local reading 500 on their own clocks, 100 ms apart
        // in real time
        assert_eq!(a.capture.starts()[0], 500);
        assert_eq!(b.capture.starts()[0], 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_start() {
        let clock = TokioClock::new(0);
        let h = field("a", Arc::new(clock));
        h.node
            .handle(
                message(MessageKind::StartRecording, "cmd", 0, Some(Payload::start(500))),
                0,
                None,
            )
            .await;
        assert!(h.node.pending.is_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.node
            .handle(message(MessageKind::StopRecording, "cmd", 200, None), 200, None)
            .await;
        assert!(!h.node.pending.is_pending());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.capture.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_recording_is_noop_and_stop_is_idempotent() {
        let clock = TokioClock::new(0);
        let mut h = field("a", Arc::new(clock));
        let start = message(MessageKind::StartRecording, "cmd", 0, Some(Payload::start(100)));

        h.node.handle(start.clone(), 0, None).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.capture.is_locally_recording());

        h.node.handle(start, 150, None).await;
        assert!(!h.node.pending.is_pending());

        let stop = message(MessageKind::StopRecording, "cmd", 200, None);
        h.node.handle(stop.clone(), 200, None).await;
        h.node.handle(stop, 201, None).await;
        assert_eq!(h.capture.history().len(), 2);

        // Telemetry followed each transition
        let mut statuses = Vec::new();
        while let Ok(sent) = h.upstream.try_recv() {
            assert_eq!(sent.kind, MessageKind::Telemetry);
            statuses.push(sent.payload.unwrap().status.unwrap());
        }
        assert_eq!(statuses, vec![DeviceStatus::Recording, DeviceStatus::Online]);
    }

    #[tokio::test]
    async fn test_field_ignores_own_messages_and_forwards_others() {
        let mut h = field("a", Arc::new(TokioClock::new(0)));
        let (conn, _rx) = Connection::channel(peer(), 1);

        let own = Inbound {
            connection: conn.id(),
            received_at: 5,
            message: message(MessageKind::GenericCommand, "a", 1, None),
        };
        h.node.handle_link_event(LinkEvent::Message(own)).await;
        assert!(h.events.try_recv().is_err());

        let other = Inbound {
            connection: conn.id(),
            received_at: 5,
            message: message(
                MessageKind::GenericCommand,
                "cmd",
                1,
                Some(Payload::command("zoom", serde_json::json!(2))),
            ),
        };
        h.node.handle_link_event(LinkEvent::Message(other)).await;
        match h.events.try_recv().unwrap() {
            NodeEvent::Message(m) => assert_eq!(m.payload.unwrap().command.as_deref(), Some("zoom")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_field_heartbeat_reports_status() {
        let mut h = field("a", Arc::new(TokioClock::new(0)));
        h.node.on_tick().await;
        let hb = h.upstream.recv().await.unwrap();
        assert_eq!(hb.kind, MessageKind::Heartbeat);
        let payload = hb.payload.unwrap();
        assert_eq!(payload.name.as_deref(), Some("a cam"));
        assert_eq!(payload.status, Some(DeviceStatus::Online));
        assert_eq!(payload.protocol, Some(ProtocolHint::Fast));
    }

    #[tokio::test]
    async fn test_leave_sends_offline_telemetry() {
        let mut h = field("a", Arc::new(TokioClock::new(0)));
        let leave = h.node.leave(Duration::from_millis(50));
        let recv = h.upstream.recv();
        let ((), sent) = tokio::join!(leave, recv);
        let sent = sent.unwrap();
        assert_eq!(sent.kind, MessageKind::Telemetry);
        assert_eq!(sent.payload.unwrap().status, Some(DeviceStatus::Offline));
    }

    #[tokio::test]
    async fn test_commander_loopback_is_deferred() {
        let mut h = commander(Arc::new(TokioClock::new(1_000)));

        let out = h
            .node
            .dispatch(MessageKind::StartRecording, Some(Payload::start(500)))
            .await
            .unwrap();
        assert!(out.looped_back);
        // The local handler has not run yet
        assert!(!h.node.pending.is_pending());

        let looped = h.loopback.recv().await.unwrap();
        h.node.handle(looped, 1_000, None).await;
        assert!(h.node.pending.is_pending());
    }

    #[tokio::test]
    async fn test_commander_handshake_tracks_and_replies_sync() {
        let h = commander(Arc::new(TokioClock::new(0)));
        let mut events = h.node.events.subscribe();
        let (conn, mut rx) = Connection::channel(peer(), 4);
        h.peers.insert(conn.clone()).await;

        let hello = Inbound {
            connection: conn.id(),
            received_at: 10,
            message: message(
                MessageKind::Handshake,
                "f1",
                3,
                Some(Payload::device("North", DeviceStatus::Online, "0.5x")),
            ),
        };
        h.node.handle_link_event(LinkEvent::Message(hello)).await;

        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::Sync);
        let devices = h.node.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, "North");

        assert!(matches!(events.try_recv().unwrap(), NodeEvent::MembershipChanged(d) if d.len() == 1));
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::Message(m) if m.kind == MessageKind::Handshake));
    }

    #[tokio::test]
    async fn test_commander_preview_dedup() {
        let h = commander(Arc::new(TokioClock::new(0)));
        let mut events = h.node.events.subscribe();
        let preview = |img: &str| {
            message(
                MessageKind::PreviewFrame,
                "f1",
                0,
                Some(Payload::default().with_preview(img)),
            )
        };

        // Unknown node: nothing tracked, message still forwarded
        h.node.handle(preview("p1"), 0, None).await;
        assert!(h.node.devices().is_empty());
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::Message(_)));

        h.node
            .handle(message(MessageKind::Heartbeat, "f1", 0, None), 0, None)
            .await;
        let _ = events.try_recv();
        let _ = events.try_recv();

        h.node.handle(preview("p1"), 1, None).await;
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::MembershipChanged(_)));
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::Message(_)));

        h.node.handle(preview("p1"), 2, None).await;
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::Message(_)));
        assert_eq!(h.node.devices()[0].latest_preview_frame.as_deref(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commander_tick_syncs_and_sweeps() {
        let clock = TokioClock::new(0);
        let h = commander(Arc::new(clock));
        let mut events = h.node.events.subscribe();
        let (conn, mut rx) = Connection::channel(peer(), 4);
        h.peers.insert(conn).await;

        h.node
            .handle(message(MessageKind::Heartbeat, "f1", 0, None), 0, None)
            .await;
        while events.try_recv().is_ok() {}

        h.node.on_tick().await;
        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::Sync);
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(15_001)).await;
        h.node.on_tick().await;
        assert!(matches!(events.try_recv().unwrap(), NodeEvent::MembershipChanged(d) if d.is_empty()));
    }

    #[tokio::test]
    async fn test_commander_recording_emits_no_telemetry() {
        let h = commander(Arc::new(TokioClock::new(0)));
        let (conn, mut rx) = Connection::channel(peer(), 4);
        h.peers.insert(conn).await;

        h.node.begin_recording().await.unwrap();
        assert!(h.capture.is_locally_recording());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deactivated_node_drops_everything() {
        let h = field("a", Arc::new(TokioClock::new(0)));
        h.node.deactivate();

        h.node
            .handle(
                message(MessageKind::StartRecording, "cmd", 0, Some(Payload::start(100))),
                0,
                None,
            )
            .await;
        assert!(!h.node.pending.is_pending());
        assert!(h.node.dispatch(MessageKind::Heartbeat, None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commander_ignores_triggers_from_field_nodes() {
        let h = commander(Arc::new(TokioClock::new(0)));
        let mut events = h.node.events.subscribe();
        let (conn, _rx) = Connection::channel(peer(), 4);
        h.peers.insert(conn.clone()).await;

        let start = Inbound {
            connection: conn.id(),
            received_at: 0,
            message: message(MessageKind::StartRecording, "f1", 0, Some(Payload::start(100))),
        };
        h.node.handle_link_event(LinkEvent::Message(start)).await;
        assert!(!h.node.pending.is_pending());

        // Observers still see it
        assert!(matches!(
            events.try_recv().unwrap(),
            NodeEvent::Message(m) if m.kind == MessageKind::StartRecording
        ));

        h.node.begin_recording().await.unwrap();
        let stop = Inbound {
            connection: conn.id(),
            received_at: 10,
            message: message(MessageKind::StopRecording, "f1", 10, None),
        };
        h.node.handle_link_event(LinkEvent::Message(stop)).await;
        assert!(h.capture.is_locally_recording());
        assert_eq!(h.capture.history().len(), 1);
    }

    #[derive(Debug)]
    struct RefusingCapture;

    #[async_trait::async_trait]
    impl CaptureLayer for RefusingCapture {
        fn name(&self) -> &'static str {
            "refusing"
        }

        async fn begin_local_recording(&self) -> std::result::Result<(), CaptureError> {
            Err(CaptureError::StartFailed("camera busy".to_string()))
        }

        async fn end_local_recording(&self) -> std::result::Result<(), CaptureError> {
            Ok(())
        }

        fn is_locally_recording(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported_without_event() {
        let (events_tx, mut events) = broadcast::channel(8);
        let (upstream_conn, mut upstream) = Connection::channel(peer(), 4);
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(0));
        let node = Node::field(
            profile("a"),
            ClockSync::follower(Arc::clone(&clock)),
            Dispatcher::field(NodeId::from("a"), clock, upstream_conn),
            Arc::new(RefusingCapture),
            events_tx,
        );

        let err = node.begin_recording().await.unwrap_err();
        assert!(matches!(err, crate::Error::Capture(CaptureError::StartFailed(_))));
        assert!(events.try_recv().is_err());
        assert!(upstream.try_recv().is_err());
    }
}
