//! Frame-history ring over the slots of the input tensor buffer.
//!
//! Physical slots are overwritten oldest-first; the age view is derived from
//! a monotonic frame counter, so no slot data is ever moved.

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHistory {
    capacity: usize,
    frames_written: u64,
}

impl FrameHistory {
    pub fn new(capacity: usize) -> Result<Self, ConfigurationError> {
        if capacity == 0 {
            return Err(ConfigurationError::InvalidDescriptor(
                "frame history needs at least one slot".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            frames_written: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames accepted so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Slot the next frame will be written to.
    pub fn next_slot(&self) -> usize {
        (self.frames_written % self.capacity as u64) as usize
    }

    /// Claims the next slot and returns it with the 1-based frame number.
    pub fn advance(&mut self) -> (usize, u64) {
        let slot = self.next_slot();
        self.frames_written += 1;
        (slot, self.frames_written)
    }

    /// Slot holding the most recent frame.
    pub fn newest_slot(&self) -> Option<usize> {
        self.slot_for_age(0)
    }

    /// Slot holding the frame `age` steps older than the newest, if any.
    pub fn slot_for_age(&self, age: usize) -> Option<usize> {
        if age >= self.populated() {
            return None;
        }
        let frame = self.frames_written - 1 - age as u64;
        Some((frame % self.capacity as u64) as usize)
    }

    /// Number of slots that hold a written frame.
    pub fn populated(&self) -> usize {
        self.frames_written.min(self.capacity as u64) as usize
    }

    pub fn is_warm(&self) -> bool {
        self.populated() == self.capacity
    }

    /// Physical slots ordered from newest to oldest.
    pub fn slots_by_age(&self) -> Vec<usize> {
        (0..self.populated())
            .filter_map(|age| self.slot_for_age(age))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_rotate_modulo_capacity() {
        let mut history = FrameHistory::new(3).expect("three slots");
        let slots: Vec<usize> = (0..7).map(|_| history.advance().0).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(history.frames_written(), 7);
    }

    #[test]
    fn cold_start_is_partially_populated() {
        let mut history = FrameHistory::new(3).expect("three slots");
        assert_eq!(history.newest_slot(), None);
        history.advance();
        assert_eq!(history.populated(), 1);
        assert!(!history.is_warm());
        assert_eq!(history.slots_by_age(), vec![0]);
        history.advance();
        history.advance();
        assert!(history.is_warm());
    }

    #[test]
    fn ages_track_fifo_eviction() {
        let mut history = FrameHistory::new(3).expect("three slots");
        for _ in 0..5 {
            history.advance();
        }
        // Frames 3, 4, 5 (1-based) live in slots 2, 0, 1.
        assert_eq!(history.slots_by_age(), vec![1, 0, 2]);
        assert_eq!(history.slot_for_age(3), None);
    }

    #[test]
    fn single_slot_history_always_reuses_slot_zero() {
        let mut history = FrameHistory::new(1).expect("one slot");
        assert_eq!(history.advance(), (0, 1));
        assert_eq!(history.advance(), (0, 2));
        assert_eq!(history.slots_by_age(), vec![0]);
    }

    #[test]
    fn empty_history_is_a_configuration_error() {
        let error = FrameHistory::new(0).expect_err("no slots");
        assert!(matches!(error, ConfigurationError::InvalidDescriptor(_)));
    }
}
