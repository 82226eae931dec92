//! Outbound message routing.
//!
//! A [`Dispatcher`] stamps messages with this node's identity and clock and
//! routes them by role: a field node sends upstream to its commander, a
//! commander fans out to every connected field node and loops the message
//! back to its own handler. Loopback goes through a channel drained by the
//! coordinator's event loop, so the local handler never runs inside
//! [`Dispatcher::dispatch`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::identity::{NodeId, Role};
use crate::protocol::{ControlMessage, MessageKind, Payload};
use crate::transport::{Connection, ConnectionId, ConnectionSet};

/// Outcome of sending one message to a set of connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Connections that accepted the message.
    pub delivered: usize,
    /// Connections that failed and were removed from the set.
    pub pruned: Vec<ConnectionId>,
}

/// Send `message` to every connection in `peers`.
///
/// Sends are independent: a failing connection is removed from the set and
/// the rest still receive the message. The set is snapshotted first, so
/// connections added concurrently are not visited.
pub async fn fan_out(peers: &ConnectionSet, message: &ControlMessage) -> FanOut {
    let mut report = FanOut::default();
    for connection in peers.snapshot().await {
        match connection.send(message) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(peer = %connection.peer(), error = %e, "Pruning dead connection");
                report.pruned.push(connection.id());
            }
        }
    }
    for id in &report.pruned {
        peers.remove(*id).await;
    }
    report
}

/// Where a dispatcher sends.
#[derive(Debug)]
enum Route {
    Upstream(Connection),
    Fanout {
        peers: ConnectionSet,
        loopback: mpsc::UnboundedSender<ControlMessage>,
    },
}

/// What happened to a dispatched message.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The message as sent.
    pub message: ControlMessage,
    /// Remote connections that accepted it.
    pub delivered: usize,
    /// Connections pruned while sending.
    pub pruned: Vec<ConnectionId>,
    /// Whether a copy was queued for the local handler.
    pub looped_back: bool,
}

/// Role-aware sender for one session.
#[derive(Debug)]
pub struct Dispatcher {
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    route: Route,
}

impl Dispatcher {
    /// Dispatcher for a field node with an established upstream link.
    #[must_use]
    pub fn field(node_id: NodeId, clock: Arc<dyn Clock>, upstream: Connection) -> Self {
        Self {
            node_id,
            clock,
            route: Route::Upstream(upstream),
        }
    }

    /// Dispatcher for a commander.
    ///
    /// Every dispatched message is also pushed to `loopback`, which the
    /// caller drains to run its own handler.
    #[must_use]
    pub fn commander(
        node_id: NodeId,
        clock: Arc<dyn Clock>,
        peers: ConnectionSet,
        loopback: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            node_id,
            clock,
            route: Route::Fanout { peers, loopback },
        }
    }

    /// The role this dispatcher routes for.
    #[must_use]
    pub fn role(&self) -> Role {
        match self.route {
            Route::Upstream(_) => Role::FieldNode,
            Route::Fanout { .. } => Role::Commander,
        }
    }

    /// Build a message carrying this node's identity and local send time.
    #[must_use]
    pub fn stamp(&self, kind: MessageKind, payload: Option<Payload>) -> ControlMessage {
        ControlMessage::new(kind, self.node_id.clone(), self.clock.now_ms(), payload)
    }

    /// Send a message according to this node's role.
    ///
    /// Never fails: a field node whose upstream link is gone drops the
    /// message, and failed commander-side connections are pruned.
    pub async fn dispatch(&self, kind: MessageKind, payload: Option<Payload>) -> Dispatched {
        let message = self.stamp(kind, payload);
        let mut outcome = Dispatched {
            message,
            delivered: 0,
            pruned: Vec::new(),
            looped_back: false,
        };

        match &self.route {
            Route::Upstream(upstream) => {
                if !upstream.is_open() {
                    debug!(%kind, "No live commander link, message dropped");
                    return outcome;
                }
                match upstream.send(&outcome.message) {
                    Ok(()) => outcome.delivered = 1,
                    Err(e) => warn!(%kind, error = %e, "Upstream send failed"),
                }
            }
            Route::Fanout { peers, loopback } => {
                let report = fan_out(peers, &outcome.message).await;
                outcome.delivered = report.delivered;
                outcome.pruned = report.pruned;
                // Queued only; the handler runs later on the event loop
                outcome.looped_back = loopback.send(outcome.message.clone()).is_ok();
            }
        }

        trace!(
            %kind,
            delivered = outcome.delivered,
            pruned = outcome.pruned.len(),
            looped_back = outcome.looped_back,
            "Dispatched"
        );
        outcome
    }

    /// Send a message on one specific connection, bypassing role routing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`](crate::Error::Send) if the connection is dead.
    pub fn reply(
        &self,
        connection: &Connection,
        kind: MessageKind,
        payload: Option<Payload>,
    ) -> Result<ControlMessage> {
        let message = self.stamp(kind, payload);
        connection.send(&message)?;
        Ok(message)
    }

    /// Give the upstream writer up to `limit` to send what is queued.
    ///
    /// Commander-side links are not waited on.
    pub async fn flush(&self, limit: std::time::Duration) -> bool {
        match &self.route {
            Route::Upstream(upstream) => upstream.drain(limit).await,
            Route::Fanout { .. } => true,
        }
    }

    /// Whether a dispatched message would currently reach anyone.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match &self.route {
            Route::Upstream(upstream) => upstream.is_open(),
            Route::Fanout { loopback, .. } => !loopback.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::clock::ManualClock;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn clock(now: i64) -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(now))
    }

    #[tokio::test]
    async fn test_fan_out_prunes_only_failed_connection() {
        let peers = ConnectionSet::new();
        let (a, mut rx_a) = Connection::channel(peer(), 4);
        let (b, rx_b) = Connection::channel(peer(), 4);
        let (c, mut rx_c) = Connection::channel(peer(), 4);
        peers.insert(a.clone()).await;
        peers.insert(b.clone()).await;
        peers.insert(c.clone()).await;
        drop(rx_b);

        let msg = ControlMessage::new(MessageKind::StopRecording, NodeId::from("cmd"), 1, None);
        let report = fan_out(&peers, &msg).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![b.id()]);
        assert_eq!(peers.len().await, 2);
        assert!(peers.get(b.id()).await.is_none());
        assert_eq!(rx_a.recv().await.unwrap().kind, MessageKind::StopRecording);
        assert_eq!(rx_c.recv().await.unwrap().kind, MessageKind::StopRecording);
    }

    #[tokio::test]
    async fn test_fan_out_to_empty_set() {
        let msg = ControlMessage::new(MessageKind::Sync, NodeId::from("cmd"), 1, None);
        assert_eq!(fan_out(&ConnectionSet::new(), &msg).await, FanOut::default());
    }

    #[tokio::test]
    async fn test_field_dispatch_goes_upstream_with_stamp() {
        let (upstream, mut rx) = Connection::channel(peer(), 4);
        let dispatcher = Dispatcher::field(NodeId::from("field-1"), clock(4_200), upstream);
        assert_eq!(dispatcher.role(), Role::FieldNode);

        let out = dispatcher
            .dispatch(MessageKind::Heartbeat, Some(Payload::default()))
            .await;
        assert_eq!(out.delivered, 1);
        assert!(!out.looped_back);

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.sender_id.as_str(), "field-1");
        assert_eq!(sent.timestamp, 4_200);
        assert_eq!(sent.kind, MessageKind::Heartbeat);
    }

    #[tokio::test]
    async fn test_field_dispatch_without_link_is_noop() {
        let (upstream, rx) = Connection::channel(peer(), 4);
        drop(rx);
        upstream.close();
        let dispatcher = Dispatcher::field(NodeId::from("field-1"), clock(0), upstream);
        assert!(!dispatcher.is_connected());

        let out = dispatcher.dispatch(MessageKind::Telemetry, None).await;
        assert_eq!(out.delivered, 0);
        assert!(out.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_commander_dispatch_loops_back() {
        let peers = ConnectionSet::new();
        let (a, mut rx_a) = Connection::channel(peer(), 4);
        peers.insert(a).await;
        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::commander(NodeId::from("cmd"), clock(77), peers, loop_tx);

        let out = dispatcher
            .dispatch(MessageKind::StartRecording, Some(Payload::start(750)))
            .await;
        assert_eq!(out.delivered, 1);
        assert!(out.looped_back);

        let remote = rx_a.recv().await.unwrap();
        let local = loop_rx.recv().await.unwrap();
        assert_eq!(remote, local);
        assert_eq!(local.delay_ms(), Some(750));
        assert_eq!(local.timestamp, 77);
    }

    #[tokio::test]
    async fn test_reply_targets_one_connection() {
        let peers = ConnectionSet::new();
        let (a, mut rx_a) = Connection::channel(peer(), 4);
        let (b, mut rx_b) = Connection::channel(peer(), 4);
        peers.insert(a.clone()).await;
        peers.insert(b).await;
        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::commander(NodeId::from("cmd"), clock(5), peers, loop_tx);

        dispatcher.reply(&a, MessageKind::Sync, None).unwrap();
        assert_eq!(rx_a.recv().await.unwrap().kind, MessageKind::Sync);
        assert!(rx_b.try_recv().is_err());
        assert!(loop_rx.try_recv().is_err());
    }
}
