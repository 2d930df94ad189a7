//! The per-round producer schedule: a shuffled list of staker ids, each
//! owning one fixed-length time slot. Immutable once built except for the
//! current-slot pointer.

use quill_core::{CodecError, Decodable, Encodable, Reader};

use crate::QP_TARGET_SPACING;

/// Inclusive slot time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpWindow {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QpQueue {
    /// Start of slot zero.
    time0: u32,
    slot_ids: Vec<u32>,
    current_slot: u32,
}

impl QpQueue {
    pub fn new(time0: u32, slot_ids: Vec<u32>) -> Self {
        QpQueue {
            time0,
            slot_ids,
            current_slot: 0,
        }
    }

    pub fn set_null(&mut self) {
        *self = QpQueue::default();
    }

    pub fn is_empty(&self) -> bool {
        self.slot_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slot_ids.len()
    }

    pub fn current_slot(&self) -> u32 {
        self.current_slot
    }

    pub fn slot_ids(&self) -> &[u32] {
        &self.slot_ids
    }

    /// Earliest time covered by this queue.
    pub fn min_time(&self) -> u32 {
        self.time0
    }

    /// Latest time covered by this queue.
    pub fn max_time(&self) -> u32 {
        if self.is_empty() {
            return self.time0;
        }
        self.time0 + (self.len() as u32 * QP_TARGET_SPACING) - 1
    }

    pub fn id_for_slot(&self, slot: u32) -> Option<u32> {
        self.slot_ids.get(slot as usize).copied()
    }

    pub fn current_id(&self) -> u32 {
        self.id_for_slot(self.current_slot).unwrap_or(0)
    }

    pub fn slot_for_id(&self, id: u32) -> Option<u32> {
        self.slot_ids.iter().position(|&x| x == id).map(|p| p as u32)
    }

    pub fn window_for_slot(&self, slot: u32) -> Option<QpWindow> {
        if slot as usize >= self.len() {
            return None;
        }
        let start = self.time0 + slot * QP_TARGET_SPACING;
        Some(QpWindow {
            start,
            end: start + QP_TARGET_SPACING - 1,
        })
    }

    pub fn window_for_id(&self, id: u32) -> Option<QpWindow> {
        self.slot_for_id(id).and_then(|s| self.window_for_slot(s))
    }

    pub fn current_window(&self) -> Option<QpWindow> {
        self.window_for_slot(self.current_slot)
    }

    pub fn current_slot_start(&self) -> u32 {
        self.current_window().map(|w| w.start).unwrap_or(0)
    }

    pub fn current_slot_end(&self) -> u32 {
        self.current_window().map(|w| w.end).unwrap_or(0)
    }

    pub fn slot_for_time(&self, time: u32) -> Option<u32> {
        if self.is_empty() || time < self.time0 || time > self.max_time() {
            return None;
        }
        Some((time - self.time0) / QP_TARGET_SPACING)
    }

    pub fn time_is_in_current_slot(&self, time: u32) -> bool {
        match self.current_window() {
            Some(w) => time >= w.start && time <= w.end,
            None => false,
        }
    }

    /// Advance to the next slot. Returns false when the queue is exhausted,
    /// at which point a new round must be built.
    pub fn increment_slot(&mut self) -> bool {
        if self.current_slot as usize + 1 >= self.len() {
            return false;
        }
        self.current_slot += 1;
        true
    }

    pub fn summary_string(&self) -> String {
        let ids: Vec<String> = self.slot_ids.iter().map(|id| id.to_string()).collect();
        format!(
            "t0={} slot={} [{}]",
            self.time0,
            self.current_slot,
            ids.join(",")
        )
    }
}

impl Encodable for QpQueue {
    fn encode(&self, out: &mut Vec<u8>) {
        self.time0.encode(out);
        self.slot_ids.encode(out);
        self.current_slot.encode(out);
    }
}

impl Decodable for QpQueue {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(QpQueue {
            time0: u32::decode(r)?,
            slot_ids: Vec::<u32>::decode(r)?,
            current_slot: u32::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_tile_the_round() {
        let q = QpQueue::new(1000, vec![3, 1, 2]);
        assert_eq!(q.min_time(), 1000);
        assert_eq!(q.max_time(), 1014);
        assert_eq!(
            q.window_for_slot(0),
            Some(QpWindow { start: 1000, end: 1004 })
        );
        assert_eq!(
            q.window_for_slot(2),
            Some(QpWindow { start: 1010, end: 1014 })
        );
        assert_eq!(q.window_for_id(1), q.window_for_slot(1));
        assert_eq!(q.slot_for_time(1009), Some(1));
        assert_eq!(q.slot_for_time(1015), None);
        assert_eq!(q.slot_for_time(999), None);
    }

    #[test]
    fn slot_advance_and_exhaustion() {
        let mut q = QpQueue::new(0, vec![5, 6]);
        assert_eq!(q.current_id(), 5);
        assert!(q.time_is_in_current_slot(4));
        assert!(!q.time_is_in_current_slot(5));
        assert!(q.increment_slot());
        assert_eq!(q.current_id(), 6);
        assert!(!q.increment_slot());
    }

    #[test]
    fn codec_roundtrip() {
        let mut q = QpQueue::new(777, vec![9, 4, 2, 8]);
        q.increment_slot();
        let bytes = q.to_bytes();
        assert_eq!(QpQueue::from_bytes(&bytes).unwrap(), q);
    }
}
