use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// One flag per frame, claimable from many threads at once.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CompletionBitmap {
    slots: Vec<AtomicBool>,
}

impl CompletionBitmap {
    pub fn new(total_frames: u32) -> Self {
        Self { slots: (0..total_frames).map(|_| AtomicBool::new(false)).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, frame_number: u32) -> Option<&AtomicBool> {
        (frame_number as usize).checked_sub(1).and_then(|i| self.slots.get(i))
    }

    /// Mark a 1-based frame complete.  Returns false if it was already set
    /// or is out of range; exactly one concurrent caller wins.
    pub fn claim(&self, frame_number: u32) -> bool {
        self.slot(frame_number).is_some_and(|s| {
            s.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
        })
    }

    /// Undo a claim whose data could not be stored.
    pub fn release(&self, frame_number: u32) {
        if let Some(s) = self.slot(frame_number) {
            s.store(false, Ordering::Release);
        }
    }

    pub fn is_set(&self, frame_number: u32) -> bool {
        self.slot(frame_number).is_some_and(|s| s.load(Ordering::Acquire))
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.load(Ordering::Acquire)).count()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.slots.len()
    }

    /// 1-based numbers of frames not yet complete.
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.load(Ordering::Acquire))
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }
}
