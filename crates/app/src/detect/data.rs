//! Published frames shared between the encoder thread and HTTP handlers.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ml_core::Detection;
use serde::Serialize;

/// Encoded frames kept for `/frame.jpg?frame=N` lookups.
pub(crate) const FRAME_HISTORY_CAPACITY: usize = 64;

/// One annotated frame ready to serve.
#[derive(Clone, Debug)]
pub(crate) struct PreviewPacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) replica: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) label: String,
    pub(crate) class_id: usize,
    pub(crate) score: f32,
    /// `[x1, y1, x2, y2]` in source pixels.
    pub(crate) bbox: [f32; 4],
}

impl From<&Detection> for DetectionSummary {
    fn from(det: &Detection) -> Self {
        Self {
            label: det.label.clone(),
            class_id: det.class_id,
            score: det.score,
            bbox: det.bbox_xyxy,
        }
    }
}

/// JSON body of `/detections`.
#[derive(Serialize)]
pub(crate) struct DetectionSnapshot<'a> {
    frame_number: u64,
    timestamp_ms: i64,
    fps: f32,
    replica: usize,
    detections: &'a [DetectionSummary],
}

impl<'a> From<&'a PreviewPacket> for DetectionSnapshot<'a> {
    fn from(packet: &'a PreviewPacket) -> Self {
        Self {
            frame_number: packet.frame_number,
            timestamp_ms: packet.timestamp_ms,
            fps: packet.fps,
            replica: packet.replica,
            detections: &packet.detections,
        }
    }
}

/// Bounded ring of recently published packets, newest at the back.
#[derive(Debug, Default)]
pub(crate) struct PreviewStore {
    packets: Mutex<VecDeque<PreviewPacket>>,
}

impl PreviewStore {
    pub(crate) fn publish(&self, packet: PreviewPacket) {
        let mut packets = self.lock();
        if packets.len() == FRAME_HISTORY_CAPACITY {
            packets.pop_front();
        }
        packets.push_back(packet);
    }

    pub(crate) fn latest(&self) -> Option<PreviewPacket> {
        self.lock().back().cloned()
    }

    pub(crate) fn find(&self, frame_number: u64) -> Option<PreviewPacket> {
        self.lock()
            .iter()
            .rev()
            .find(|packet| packet.frame_number == frame_number)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PreviewPacket>> {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(frame_number: u64) -> PreviewPacket {
        PreviewPacket {
            jpeg: vec![0xFF, 0xD8],
            detections: Vec::new(),
            timestamp_ms: frame_number as i64 * 33,
            frame_number,
            fps: 30.0,
            replica: 0,
        }
    }

    #[test]
    fn keeps_a_bounded_history() {
        let store = PreviewStore::default();
        assert!(store.latest().is_none());
        for n in 0..(FRAME_HISTORY_CAPACITY as u64 + 5) {
            store.publish(packet(n));
        }
        assert_eq!(store.latest().map(|p| p.frame_number), Some(FRAME_HISTORY_CAPACITY as u64 + 4));
        assert!(store.find(4).is_none());
        assert_eq!(store.find(5).map(|p| p.timestamp_ms), Some(165));
    }

    #[test]
    fn snapshot_serialises_detections() {
        let mut p = packet(7);
        p.detections.push(DetectionSummary {
            label: "person".into(),
            class_id: 0,
            score: 0.5,
            bbox: [1.0, 2.0, 3.0, 4.0],
        });
        let json = serde_json::to_value(DetectionSnapshot::from(&p)).unwrap();
        assert_eq!(json["frame_number"], 7);
        assert_eq!(json["detections"][0]["label"], "person");
        assert_eq!(json["detections"][0]["bbox"][2], 3.0);
    }
}
