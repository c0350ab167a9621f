//! Thread-safe ring buffer for the analysis window
//!
//! Holds the most recent `capacity` mono samples of the open capture session.
//! Writing past capacity overwrites the oldest samples, so the buffer always
//! contains the latest window for the level meter to analyse.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Thread-safe ring buffer for audio samples
///
/// Clones share the same underlying buffer.
#[derive(Clone)]
pub struct AudioRingBuffer {
    buffer: Arc<Mutex<HeapRb<f32>>>,
}

impl AudioRingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity))),
        }
    }

    /// Write samples to the buffer, overwriting the oldest when full
    ///
    /// Returns the number of samples written (always `samples.len()`).
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut buffer = self.buffer.lock();
        for &sample in samples {
            buffer.push_overwrite(sample);
        }
        samples.len()
    }

    /// Copy out the buffered samples, oldest first, without consuming them
    pub fn latest(&self) -> Vec<f32> {
        self.buffer.lock().iter().copied().collect()
    }

    /// Clear all samples from the buffer
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Get the number of samples currently in the buffer
    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Get the capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}
