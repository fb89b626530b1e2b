use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One chunk's worth of intensity output: evenly spaced values starting at
/// `start_time`, one per analysis hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntensitySegment {
    pub start_time: f64,
    pub frame_interval: f64,
    pub values: Vec<f32>,
}

/// Segments produced from hop-aligned chunks abut exactly, but the seam is
/// computed through two different operation orders and can differ by a few
/// ulps. Anything closer than this is abutment, not overlap.
const SEAM_TOLERANCE: f64 = 1e-6;

impl IntensitySegment {
    pub fn new(start_time: f64, frame_interval: f64, values: Vec<f32>) -> Self {
        Self {
            start_time,
            frame_interval,
            values,
        }
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.values.len() as f64 * self.frame_interval
    }

    /// Value of the frame covering `time`, or `None` outside the segment.
    pub fn sample_at(&self, time: f64) -> Option<f32> {
        let offset = time - self.start_time;
        if offset < 0.0 {
            return None;
        }
        let index = (offset / self.frame_interval) as usize;
        self.values.get(index).copied()
    }

    fn overlaps(&self, other: &IntensitySegment) -> bool {
        self.start_time + SEAM_TOLERANCE < other.end_time()
            && other.start_time + SEAM_TOLERANCE < self.end_time()
    }
}

#[derive(Debug, Default)]
struct TrackInner {
    generation: u64,
    segments: BTreeMap<usize, IntensitySegment>,
}

/// Time-indexed intensity curve for one video, built incrementally as chunks
/// complete.
///
/// Segments are keyed by chunk index and may arrive sparsely (background
/// downloads finish out of order); queries into a gap report no data rather
/// than interpolating. Insertion swaps a whole immutable segment in under a
/// short-held lock, so tick-driven readers never observe a partial chunk.
///
/// The track also carries the session generation: `clear` bumps it and
/// `insert_segment` verifies it under the same lock, so a chunk task that
/// raced a session reset can never land a stale segment in the fresh track.
#[derive(Debug, Default)]
pub struct IntensityTrack {
    inner: Mutex<TrackInner>,
}

impl IntensityTrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session generation. Chunk tasks capture this at spawn time
    /// and present it back at insert time.
    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Insert a completed chunk's segment. Rejects segments from a stale
    /// session generation, duplicates, and overlaps (recoverable invariant
    /// violations, not panics) and returns whether the segment was stored.
    pub fn insert_segment(
        &self,
        generation: u64,
        chunk_index: usize,
        segment: IntensitySegment,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            warn!("ignoring segment for chunk {} from an ended session", chunk_index);
            return false;
        }
        if inner.segments.contains_key(&chunk_index) {
            warn!("ignoring duplicate segment for chunk {}", chunk_index);
            return false;
        }
        if inner.segments.values().any(|existing| existing.overlaps(&segment)) {
            warn!(
                "ignoring overlapping segment for chunk {} ({:.2}s..{:.2}s)",
                chunk_index,
                segment.start_time,
                segment.end_time()
            );
            return false;
        }
        inner.segments.insert(chunk_index, segment);
        true
    }

    /// Intensity at `time`, or `None` where no chunk has been analyzed yet.
    pub fn query(&self, time: f64) -> Option<f32> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .values()
            .rev()
            .find(|s| s.start_time <= time)
            .and_then(|s| s.sample_at(time))
    }

    pub fn has_chunk(&self, chunk_index: usize) -> bool {
        self.inner.lock().unwrap().segments.contains_key(&chunk_index)
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().unwrap().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().segments.is_empty()
    }

    /// Discard everything and advance the session generation; called on
    /// session reset. Returns the new generation.
    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.segments.clear();
        inner.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, values: Vec<f32>) -> IntensitySegment {
        IntensitySegment::new(start, 0.5, values)
    }

    #[test]
    fn test_query_inside_segment() {
        let track = IntensityTrack::new();
        let gen = track.generation();
        assert!(track.insert_segment(gen, 0, segment(0.0, vec![0.1, 0.2, 0.3, 0.4])));
        assert_eq!(track.query(0.0), Some(0.1));
        assert_eq!(track.query(0.75), Some(0.2));
        assert_eq!(track.query(1.99), Some(0.4));
    }

    #[test]
    fn test_gap_query_returns_no_data() {
        let track = IntensityTrack::new();
        let gen = track.generation();
        track.insert_segment(gen, 0, segment(0.0, vec![0.1, 0.2]));
        // Chunk 2 arrives before chunk 1 — sparse insertion is allowed.
        track.insert_segment(gen, 2, segment(4.0, vec![0.5, 0.6]));
        assert_eq!(track.query(2.5), None, "gap must not be interpolated");
        assert_eq!(track.query(4.5), Some(0.6));
        assert_eq!(track.query(-1.0), None);
        assert_eq!(track.query(100.0), None);
    }

    #[test]
    fn test_overlapping_insert_is_rejected() {
        let track = IntensityTrack::new();
        let gen = track.generation();
        assert!(track.insert_segment(gen, 0, segment(0.0, vec![0.1, 0.2, 0.3])));
        assert!(!track.insert_segment(gen, 1, segment(1.0, vec![0.9])));
        assert!(!track.insert_segment(gen, 0, segment(10.0, vec![0.9])));
        assert_eq!(track.segment_count(), 1);
        // The original data is untouched.
        assert_eq!(track.query(1.2), Some(0.3));
    }

    #[test]
    fn test_abutting_segments_are_accepted() {
        let track = IntensityTrack::new();
        let gen = track.generation();
        assert!(track.insert_segment(gen, 0, segment(0.0, vec![0.1, 0.2])));
        assert!(track.insert_segment(gen, 1, segment(1.0, vec![0.3, 0.4])));
        // A seam landing a few ulps short of the previous end is abutment.
        assert!(track.insert_segment(gen, 2, segment(2.0 - 1e-9, vec![0.5])));
        assert_eq!(track.segment_count(), 3);
    }

    #[test]
    fn test_stale_generation_insert_is_rejected() {
        let track = IntensityTrack::new();
        let old_gen = track.generation();
        assert!(track.insert_segment(old_gen, 0, segment(0.0, vec![0.1])));

        // A chunk task that captured the old generation, then lost the race
        // with a session reset, must not write into the fresh track.
        let new_gen = track.clear();
        assert!(!track.insert_segment(old_gen, 0, segment(0.0, vec![0.9])));
        assert!(track.is_empty());

        assert!(track.insert_segment(new_gen, 0, segment(0.0, vec![0.2])));
        assert_eq!(track.query(0.0), Some(0.2));
    }

    #[test]
    fn test_clear_discards_all_segments() {
        let track = IntensityTrack::new();
        let gen = track.generation();
        track.insert_segment(gen, 0, segment(0.0, vec![0.1]));
        track.clear();
        assert!(track.is_empty());
        assert_eq!(track.query(0.0), None);
    }
}
