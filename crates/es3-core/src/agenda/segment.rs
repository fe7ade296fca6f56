//! Pool-tracked byte buffers.

use std::sync::Arc;

use crate::agenda::Agenda;

/// An owned byte buffer counted against the agenda's in-flight cap.
/// Dropping the segment releases its pool slot and wakes waiting workers.
pub struct Segment {
    data: Vec<u8>,
    agenda: Arc<Agenda>,
}

impl Segment {
    /// Wraps an already-reserved pool slot. Callers go through
    /// `Agenda::acquire_segments` or the dispatcher, never here.
    pub(crate) fn new(agenda: Arc<Agenda>) -> Self {
        Self { data: Vec::new(), agenda }
    }

    /// The underlying buffer. Starts empty; fill or resize as needed, the
    /// pool only tracks slot counts, not byte counts.
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.agenda.release_segment_slot();
    }
}
