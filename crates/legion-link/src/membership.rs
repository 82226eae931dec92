//! Commander-side view of the field nodes in a session.
//!
//! The tracker itself is a plain data structure; the coordinator owns it
//! behind a lock and decides when to notify listeners. A record is created
//! or refreshed by any handshake, heartbeat or telemetry message, and
//! dropped by [`MembershipTracker::sweep`] once its sender has been silent
//! for longer than the liveness timeout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::identity::{NodeId, Role};
use crate::protocol::ControlMessage;
use crate::transport::ProtocolHint;

/// Liveness timeout used when none is configured.
pub const DEFAULT_LIVENESS_TIMEOUT_MS: i64 = 15_000;

/// What a field node reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Connected and idle.
    #[default]
    Online,
    /// Currently recording.
    Recording,
    /// Announced that it is leaving.
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Recording => write!(f, "recording"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// One known field node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Identity of the field node.
    pub id: NodeId,
    /// Name shown in the device list.
    pub display_name: String,
    /// Always [`Role::FieldNode`] from the commander's point of view.
    pub role: Role,
    /// Last reported status.
    pub status: DeviceStatus,
    /// Last reported lens label.
    pub current_lens_label: Option<String>,
    /// Last preview image the node sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_preview_frame: Option<String>,
    /// BLAKE3 digest of `latest_preview_frame`.
    pub preview_digest: Option<String>,
    /// Transport hint the node connected with, if it said.
    pub protocol: Option<ProtocolHint>,
    /// Commander-local time the node was last heard from.
    pub last_seen_at: i64,
}

impl DeviceRecord {
    fn new(id: NodeId, now: i64) -> Self {
        let display_name = format!("node-{}", id.short());
        Self {
            id,
            display_name,
            role: Role::FieldNode,
            status: DeviceStatus::Online,
            current_lens_label: None,
            latest_preview_frame: None,
            preview_digest: None,
            protocol: None,
            last_seen_at: now,
        }
    }

    /// Milliseconds since the node was last heard from.
    #[must_use]
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.last_seen_at
    }

    fn set_preview(&mut self, image: String) -> bool {
        let digest = blake3::hash(image.as_bytes()).to_hex().to_string();
        if self.preview_digest.as_ref() == Some(&digest) {
            return false;
        }
        self.preview_digest = Some(digest);
        self.latest_preview_frame = Some(image);
        true
    }
}

/// The set of field nodes a commander currently considers live.
#[derive(Debug)]
pub struct MembershipTracker {
    records: HashMap<NodeId, DeviceRecord>,
    liveness_timeout_ms: i64,
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_TIMEOUT_MS)
    }
}

impl MembershipTracker {
    /// Create an empty tracker that evicts after `liveness_timeout_ms` of silence.
    #[must_use]
    pub fn new(liveness_timeout_ms: i64) -> Self {
        Self {
            records: HashMap::new(),
            liveness_timeout_ms,
        }
    }

    /// The configured liveness timeout.
    #[must_use]
    pub fn liveness_timeout_ms(&self) -> i64 {
        self.liveness_timeout_ms
    }

    /// Fold an inbound message into the device set.
    ///
    /// Returns `true` when the message was a membership signal (handshake,
    /// heartbeat or telemetry) and the set was updated; listeners should be
    /// notified. Any other kind is ignored and returns `false`.
    pub fn observe(&mut self, message: &ControlMessage, now: i64) -> bool {
        if !message.kind.refreshes_membership() {
            return false;
        }

        let record = self
            .records
            .entry(message.sender_id.clone())
            .or_insert_with(|| {
                info!(node = %message.sender_id, kind = %message.kind, "Field node joined");
                DeviceRecord::new(message.sender_id.clone(), now)
            });

        record.last_seen_at = now;
        if let Some(payload) = &message.payload {
            if let Some(name) = &payload.name {
                record.display_name.clone_from(name);
            }
            if let Some(status) = payload.status {
                record.status = status;
            }
            if let Some(lens) = &payload.lens {
                record.current_lens_label = Some(lens.clone());
            }
            if let Some(hint) = payload.protocol {
                record.protocol = Some(hint);
            }
            if let Some(image) = &payload.preview_image {
                record.set_preview(image.clone());
            }
        }

        debug!(
            node = %record.id,
            status = %record.status,
            kind = %message.kind,
            "Device record refreshed"
        );
        true
    }

    /// Store a preview frame for an already-known device.
    ///
    /// Preview frames never create or refresh membership. Returns `true` only
    /// when the device exists and the image differs from the stored one.
    pub fn record_preview(&mut self, sender: &NodeId, image: String) -> bool {
        match self.records.get_mut(sender) {
            Some(record) => record.set_preview(image),
            None => {
                debug!(node = %sender, "Preview frame from unknown node ignored");
                false
            }
        }
    }

    /// Evict every record silent for longer than the liveness timeout.
    ///
    /// Returns the evicted records; listeners should be notified only when
    /// this is non-empty.
    pub fn sweep(&mut self, now: i64) -> Vec<DeviceRecord> {
        let timeout = self.liveness_timeout_ms;
        let stale: Vec<NodeId> = self
            .records
            .values()
            .filter(|r| r.age_ms(now) > timeout)
            .map(|r| r.id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .inspect(|record| {
                info!(
                    node = %record.id,
                    silent_ms = record.age_ms(now),
                    "Field node evicted after silence"
                );
            })
            .collect()
    }

    /// Current device list, sorted by display name then identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.records.values().cloned().collect();
        devices.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// Look up a single device.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&DeviceRecord> {
        self.records.get(id)
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no devices are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::protocol::{MessageKind, Payload};

    fn msg(kind: MessageKind, sender: &str, payload: Option<Payload>) -> ControlMessage {
        ControlMessage::new(kind, NodeId::from(sender), 0, payload)
    }

    fn ids(tracker: &MembershipTracker) -> BTreeSet<String> {
        tracker
            .snapshot()
            .into_iter()
            .map(|r| r.id.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_handshake_creates_record() {
        let mut tracker = MembershipTracker::default();
        let payload = Payload::device("North Cam", DeviceStatus::Online, "0.5x")
            .with_protocol(ProtocolHint::Fast);
        assert!(tracker.observe(&msg(MessageKind::Handshake, "n1", Some(payload)), 100));

        let record = tracker.get(&NodeId::from("n1")).unwrap();
        assert_eq!(record.display_name, "North Cam");
        assert_eq!(record.role, Role::FieldNode);
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.current_lens_label.as_deref(), Some("0.5x"));
        assert_eq!(record.protocol, Some(ProtocolHint::Fast));
        assert_eq!(record.last_seen_at, 100);
    }

    #[test]
    fn test_heartbeat_alone_establishes_membership() {
        let mut tracker = MembershipTracker::default();
        assert!(tracker.observe(&msg(MessageKind::Heartbeat, "abcdef0123", None), 5));
        let record = tracker.get(&NodeId::from("abcdef0123")).unwrap();
        assert_eq!(record.display_name, "node-abcdef01");
        assert_eq!(record.status, DeviceStatus::Online);
    }

    #[test]
    fn test_other_kinds_are_ignored() {
        let mut tracker = MembershipTracker::default();
        for kind in [
            MessageKind::Sync,
            MessageKind::StartRecording,
            MessageKind::StopRecording,
            MessageKind::PreviewFrame,
            MessageKind::GenericCommand,
        ] {
            assert!(!tracker.observe(&msg(kind, "n1", None), 0));
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_update_keeps_unreported_fields() {
        let mut tracker = MembershipTracker::default();
        tracker.observe(
            &msg(
                MessageKind::Handshake,
                "n1",
                Some(Payload::device("Cam", DeviceStatus::Online, "1x")),
            ),
            0,
        );
        let telemetry = Payload {
            status: Some(DeviceStatus::Recording),
            ..Payload::default()
        };
        tracker.observe(&msg(MessageKind::Telemetry, "n1", Some(telemetry)), 900);

        let record = tracker.get(&NodeId::from("n1")).unwrap();
        assert_eq!(record.display_name, "Cam");
        assert_eq!(record.current_lens_label.as_deref(), Some("1x"));
        assert_eq!(record.status, DeviceStatus::Recording);
        assert_eq!(record.last_seen_at, 900);
    }

    #[test]
    fn test_sweep_boundary_is_strictly_greater() {
        let mut tracker = MembershipTracker::new(15_000);
        tracker.observe(&msg(MessageKind::Heartbeat, "n1", None), 0);

        assert!(tracker.sweep(15_000).is_empty());
        assert_eq!(tracker.len(), 1);

        let evicted = tracker.sweep(15_001);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id.as_str(), "n1");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_sweep_reports_nothing_when_all_fresh() {
        let mut tracker = MembershipTracker::new(15_000);
        tracker.observe(&msg(MessageKind::Heartbeat, "n1", None), 10_000);
        tracker.observe(&msg(MessageKind::Telemetry, "n2", None), 12_000);
        assert!(tracker.sweep(20_000).is_empty());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_refresh_postpones_eviction() {
        let mut tracker = MembershipTracker::new(15_000);
        tracker.observe(&msg(MessageKind::Heartbeat, "n1", None), 0);
        tracker.observe(&msg(MessageKind::Heartbeat, "n1", None), 10_000);
        assert!(tracker.sweep(20_000).is_empty());
        assert_eq!(tracker.sweep(25_001).len(), 1);
    }

    #[test]
    fn test_snapshot_matches_recent_senders() {
        // Pseudo-random arrivals checked against a brute-force model: after
        // every sweep the tracker holds exactly the senders heard from within
        // the timeout.
        let mut tracker = MembershipTracker::new(15_000);
        let mut last_seen: BTreeMap<String, i64> = BTreeMap::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut now: i64 = 0;

        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            now += i64::try_from(seed % 1_500).unwrap();
            let sender = format!("node-{}", seed % 7);
            let kind = if seed % 2 == 0 {
                MessageKind::Heartbeat
            } else {
                MessageKind::Telemetry
            };
            tracker.observe(&msg(kind, &sender, None), now);
            last_seen.insert(sender, now);

            if step % 5 == 0 {
                tracker.sweep(now);
                let expected: BTreeSet<String> = last_seen
                    .iter()
                    .filter(|(_, seen)| now - **seen <= 15_000)
                    .map(|(id, _)| id.clone())
                    .collect();
                assert_eq!(ids(&tracker), expected, "mismatch at step {step}");
            }
        }
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let mut tracker = MembershipTracker::default();
        for (id, name) in [("z", "Bravo"), ("a", "Charlie"), ("m", "Alpha")] {
            tracker.observe(
                &msg(
                    MessageKind::Handshake,
                    id,
                    Some(Payload::device(name, DeviceStatus::Online, "1x")),
                ),
                0,
            );
        }
        let names: Vec<String> = tracker
            .snapshot()
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Bravo", "Charlie"]);
    }

    #[test]
    fn test_preview_only_for_known_devices() {
        let mut tracker = MembershipTracker::default();
        assert!(!tracker.record_preview(&NodeId::from("ghost"), "img".to_string()));
        assert!(tracker.is_empty());

        tracker.observe(&msg(MessageKind::Heartbeat, "n1", None), 0);
        let id = NodeId::from("n1");
        assert!(tracker.record_preview(&id, "frame-1".to_string()));
        assert!(!tracker.record_preview(&id, "frame-1".to_string()));
        assert!(tracker.record_preview(&id, "frame-2".to_string()));

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.latest_preview_frame.as_deref(), Some("frame-2"));
        assert_eq!(
            record.preview_digest.as_deref(),
            Some(blake3::hash(b"frame-2").to_hex().as_str())
        );
        assert_eq!(record.last_seen_at, 0);
    }

    #[test]
    fn test_device_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Recording).unwrap(),
            "\"RECORDING\""
        );
        assert_eq!(DeviceStatus::Offline.to_string(), "offline");
    }
}
