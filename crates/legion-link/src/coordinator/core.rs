//! The application-facing coordinator.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::capture::CaptureLayer;
use crate::clock::{Clock, ClockSync};
use crate::config::Config;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::error::{Error, Result};
use crate::identity::{NodeId, Role};
use crate::membership::{DeviceRecord, DeviceStatus};
use crate::protocol::{ControlMessage, MessageKind, Payload};
use crate::transport::{self, ConnectionSet, LinkSettings, ProtocolHint};
use crate::trigger;

use super::events::{spawn_listener, NodeEvent, EVENT_CHANNEL_CAPACITY};
use super::node::{run_event_loop, run_timer, Node, Profile};
use super::SessionState;

/// Inbound link events buffered ahead of the event loop.
const INBOUND_QUEUE: usize = 256;

/// One initialized session: the protocol engine plus every task serving it.
#[derive(Debug)]
struct Session {
    node: Arc<Node>,
    tasks: JoinSet<()>,
    local_addr: Option<SocketAddr>,
}

/// Owns one node's participation in a capture cluster.
///
/// Create one per process, [`initialize`](Self::initialize) it as a
/// commander or a field node, and observe it through
/// [`subscribe`](Self::subscribe) or the `on_*` helpers. The node's identity
/// is fixed at construction and survives re-initialization.
#[derive(Debug)]
pub struct Coordinator {
    node_id: NodeId,
    config: Config,
    clock: Arc<dyn Clock>,
    capture: Arc<dyn CaptureLayer>,
    events: broadcast::Sender<NodeEvent>,
    state: Mutex<SessionState>,
    session: tokio::sync::Mutex<Option<Session>>,
    abort: Notify,
}

impl Coordinator {
    /// Create an uninitialized coordinator with a fresh identity.
    #[must_use]
    pub fn new(config: Config, capture: Arc<dyn CaptureLayer>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            node_id: NodeId::generate(),
            config,
            clock,
            capture,
            events,
            state: Mutex::new(SessionState::Uninitialized),
            session: tokio::sync::Mutex::new(None),
            abort: Notify::new(),
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The configuration this coordinator was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Move to `next` if `allowed` accepts the current state. Returns the
    /// previous state, or the current one when the move was refused.
    fn transition(
        &self,
        allowed: impl FnOnce(SessionState) -> bool,
        next: SessionState,
    ) -> std::result::Result<SessionState, SessionState> {
        let previous = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !allowed(*state) {
                return Err(*state);
            }
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
            let _ = self.events.send(NodeEvent::StateChanged(next));
        }
        Ok(previous)
    }

    /// Start a session.
    ///
    /// A commander binds its listening socket and is active at once. A field
    /// node needs `target`, connects to it, sends its handshake, and is active
    /// once connected; the handshake is not awaited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the coordinator is uninitialized
    /// or terminated. Listen and connect failures return the matching
    /// initialization error and leave the coordinator uninitialized. A
    /// [`teardown`](Self::teardown) while connecting abandons the attempt
    /// with [`Error::InitializationAborted`].
    pub async fn initialize(
        &self,
        role: Role,
        hint: ProtocolHint,
        target: Option<&str>,
    ) -> Result<()> {
        let aborted = self.abort.notified();
        self.transition(SessionState::can_initialize, SessionState::Initializing)
            .map_err(|state| Error::InvalidState {
                operation: "initialize",
                state,
            })?;

        let attempt = async {
            match role {
                Role::Commander => self.start_commander(hint).await,
                Role::FieldNode => self.start_field(hint, target).await,
            }
        };
        let started = tokio::select! {
            started = attempt => started,
            () = aborted => Err(Error::InitializationAborted),
        };

        let mut session = match started {
            Ok(session) => session,
            Err(e) => {
                warn!(%role, error = %e, "Initialization failed");
                let _ = self.transition(
                    |s| s == SessionState::Initializing,
                    SessionState::Uninitialized,
                );
                return Err(e);
            }
        };

        let mut slot = self.session.lock().await;
        if self
            .transition(|s| s == SessionState::Initializing, SessionState::Active)
            .is_err()
        {
            drop(slot);
            info!(%role, "Torn down while initializing, discarding session");
            session.node.deactivate();
            session.tasks.shutdown().await;
            return Err(Error::InitializationAborted);
        }
        info!(
            node = %self.node_id,
            %role,
            %hint,
            addr = ?session.local_addr,
            "Session active"
        );
        *slot = Some(session);
        Ok(())
    }

    fn profile(&self, hint: ProtocolHint) -> Profile {
        Profile {
            id: self.node_id.clone(),
            hint,
            display_name: self.config.display_name(&self.node_id),
            lens_label: self.config.node.lens_label.clone(),
            lead_ms: self.config.sync.lead_ms,
        }
    }

    async fn start_commander(&self, hint: ProtocolHint) -> Result<Session> {
        let listener = transport::listen(self.config.listen_addr(hint)).await?;
        let local_addr = listener.local_addr()?;

        let peers = ConnectionSet::new();
        let (link_tx, link_rx) = mpsc::channel(INBOUND_QUEUE);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::commander(
            self.node_id.clone(),
            Arc::clone(&self.clock),
            peers.clone(),
            loop_tx,
        );
        let node = Arc::new(Node::commander(
            self.profile(hint),
            ClockSync::reference(Arc::clone(&self.clock)),
            dispatcher,
            peers.clone(),
            self.config.liveness_timeout_ms(),
            Arc::clone(&self.capture),
            self.events.clone(),
        ));

        let mut tasks = JoinSet::new();
        tasks.spawn(transport::accept_loop(
            listener,
            peers,
            LinkSettings::from(&self.config.network),
            Arc::clone(&self.clock),
            link_tx,
        ));
        tasks.spawn(run_event_loop(Arc::clone(&node), link_rx, loop_rx));
        tasks.spawn(run_timer(Arc::clone(&node), self.config.heartbeat_interval()));

        Ok(Session {
            node,
            tasks,
            local_addr: Some(local_addr),
        })
    }

    async fn start_field(&self, hint: ProtocolHint, target: Option<&str>) -> Result<Session> {
        let target = target.ok_or(Error::MissingTargetAddress)?;
        let addr = transport::resolve_target(target, hint.port(&self.config.network))?;
        let stream = transport::connect(&addr, self.config.connect_timeout()).await?;
        let local_addr = stream.local_addr().ok();

        let mut tasks = JoinSet::new();
        let (link_tx, link_rx) = mpsc::channel(INBOUND_QUEUE);
        let upstream = transport::spawn_link(
            stream,
            LinkSettings::from(&self.config.network),
            Arc::clone(&self.clock),
            link_tx,
            &mut tasks,
        )?;
        // Field nodes never loop back; a closed channel keeps the loop simple
        let (_, loop_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::field(self.node_id.clone(), Arc::clone(&self.clock), upstream);
        let node = Arc::new(Node::field(
            self.profile(hint),
            ClockSync::follower(Arc::clone(&self.clock)),
            dispatcher,
            Arc::clone(&self.capture),
            self.events.clone(),
        ));

        tasks.spawn(run_event_loop(Arc::clone(&node), link_rx, loop_rx));
        tasks.spawn(run_timer(Arc::clone(&node), self.config.heartbeat_interval()));

        let hello = node.device_payload(DeviceStatus::Online);
        node.dispatch(MessageKind::Handshake, Some(hello)).await;

        Ok(Session {
            node,
            tasks,
            local_addr,
        })
    }

    /// End the session: close every link, stop timers, cancel any pending
    /// start. A field node first tells its commander it is going offline.
    ///
    /// An [`initialize`](Self::initialize) still in progress is abandoned.
    /// Calling this with no session just marks the coordinator terminated.
    pub async fn teardown(&self) {
        let session = {
            let mut slot = self.session.lock().await;
            if let Ok(SessionState::Initializing) =
                self.transition(|_| true, SessionState::Terminated)
            {
                self.abort.notify_waiters();
            }
            slot.take()
        };
        if let Some(mut session) = session {
            let limit = LinkSettings::from(&self.config.network).write_timeout;
            session.node.leave(limit).await;
            session.node.deactivate();
            session.tasks.shutdown().await;
            info!(node = %self.node_id, "Session torn down");
        }
    }

    async fn node(&self) -> Option<Arc<Node>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.node))
    }

    async fn active_node(&self, operation: &'static str) -> Result<Arc<Node>> {
        let state = self.state();
        match self.node().await {
            Some(node) if state.is_active() => Ok(node),
            _ => Err(Error::InvalidState { operation, state }),
        }
    }

    async fn commander_node(&self, operation: &'static str) -> Result<Arc<Node>> {
        let node = self.active_node(operation).await?;
        if node.role() != Role::Commander {
            return Err(Error::NotCommander { operation });
        }
        Ok(node)
    }

    /// Start recording on every node at the same synchronized instant.
    ///
    /// Returns the synchronized time at which recording will begin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless active, and
    /// [`Error::NotCommander`] on a field node.
    pub async fn trigger_global_start(&self) -> Result<i64> {
        let node = self.commander_node("trigger a global start").await?;
        let lead = node.lead_ms();
        let fire_at = trigger::fire_at(node.sync().synchronized_now(), lead);
        let sent = node
            .dispatch(MessageKind::StartRecording, Some(Payload::start(lead)))
            .await;
        info!(
            fire_at,
            lead_ms = lead,
            delivered = sent.map_or(0, |d| d.delivered),
            "Global start issued"
        );
        Ok(fire_at)
    }

    /// Stop recording on every node now. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless active, and
    /// [`Error::NotCommander`] on a field node.
    pub async fn trigger_global_stop(&self) -> Result<()> {
        let node = self.commander_node("trigger a global stop").await?;
        let sent = node.dispatch(MessageKind::StopRecording, None).await;
        info!(delivered = sent.map_or(0, |d| d.delivered), "Global stop issued");
        Ok(())
    }

    /// Send an application command to every field node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless active, and
    /// [`Error::NotCommander`] on a field node.
    pub async fn send_command(&self, name: &str, data: serde_json::Value) -> Result<()> {
        let node = self.commander_node("send a command").await?;
        node.dispatch(MessageKind::GenericCommand, Some(Payload::command(name, data)))
            .await;
        Ok(())
    }

    /// Send a viewfinder image to the commander.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless active.
    pub async fn send_preview_frame(&self, image: impl Into<String>) -> Result<()> {
        let node = self.active_node("send a preview frame").await?;
        node.dispatch(
            MessageKind::PreviewFrame,
            Some(Payload::default().with_preview(image)),
        )
        .await;
        Ok(())
    }

    /// Dispatch an arbitrary message by role. Does nothing without a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCommander`] for a start or stop command on a
    /// field node.
    pub async fn dispatch(
        &self,
        kind: MessageKind,
        payload: Option<Payload>,
    ) -> Result<Option<Dispatched>> {
        let Some(node) = self.node().await else {
            debug!(%kind, "No session, message dropped");
            return Ok(None);
        };
        if kind.is_trigger() && node.role() != Role::Commander {
            return Err(Error::NotCommander {
                operation: "dispatch start or stop commands",
            });
        }
        Ok(node.dispatch(kind, payload).await)
    }

    /// Role of the current session, if any.
    pub async fn current_role(&self) -> Option<Role> {
        self.node().await.map(|n| n.role())
    }

    /// Transport hint of the current session, if any.
    pub async fn current_hint(&self) -> Option<ProtocolHint> {
        self.node().await.map(|n| n.hint())
    }

    /// Best estimate of the commander's clock. Without a session this is
    /// the local clock.
    pub async fn synchronized_now(&self) -> i64 {
        match self.node().await {
            Some(node) => node.sync().synchronized_now(),
            None => self.clock.now_ms(),
        }
    }

    /// Current clock offset estimate in milliseconds.
    pub async fn clock_offset_ms(&self) -> i64 {
        self.node().await.map_or(0, |n| n.sync().offset_ms())
    }

    /// The commander's device list. Empty on a field node.
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.node().await.map(|n| n.devices()).unwrap_or_default()
    }

    /// Address the session's socket is bound to: the listener on a
    /// commander, the local end of the link on a field node.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().await.as_ref().and_then(|s| s.local_addr)
    }

    /// Whether the local capture layer is recording.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.capture.is_locally_recording()
    }

    /// Receive every [`NodeEvent`] from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Call `listener` with each new device list.
    pub fn on_membership_changed<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<DeviceRecord>) + Send + 'static,
    {
        spawn_listener(
            self.subscribe(),
            |event| match event {
                NodeEvent::MembershipChanged(devices) => Some(devices),
                _ => None,
            },
            listener,
        )
    }

    /// Call `listener` with every handled control message.
    pub fn on_message<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: FnMut(ControlMessage) + Send + 'static,
    {
        spawn_listener(
            self.subscribe(),
            |event| match event {
                NodeEvent::Message(message) => Some(message),
                _ => None,
            },
            listener,
        )
    }
}
