use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{ShaleDBError, ShaleDBResult};
use log::trace;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct FrameEntry {
    access_count: usize,
    evictable: bool,
}

/// LRU-K replacement policy.
///
/// Frames with fewer than K recorded accesses live in the history list and
/// are preferred for eviction; frames with at least K accesses live in the
/// cache list. Both lists keep the most recently moved frame at the front,
/// so the back of either list is the oldest candidate.
#[derive(Debug)]
pub struct LRUKReplacer {
    num_frames: usize,
    k: usize,
    history: VecDeque<FrameId>,
    cache: VecDeque<FrameId>,
    entries: HashMap<FrameId, FrameEntry>,
    // number of frames currently marked evictable
    curr_size: usize,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0);
        Self {
            num_frames,
            k,
            history: VecDeque::new(),
            cache: VecDeque::new(),
            entries: HashMap::with_capacity(num_frames),
            curr_size: 0,
        }
    }

    fn detach(list: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = list.iter().position(|&f| f == frame_id) {
            list.remove(pos);
        }
    }

    fn check_frame(&self, frame_id: FrameId) -> ShaleDBResult<()> {
        if frame_id >= self.num_frames {
            return Err(ShaleDBError::Internal(format!(
                "frame {} out of range (replacer holds {} frames)",
                frame_id, self.num_frames
            )));
        }
        Ok(())
    }
}

impl Replacer for LRUKReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> ShaleDBResult<()> {
        self.check_frame(frame_id)?;
        let entry = self.entries.entry(frame_id).or_default();
        entry.access_count += 1;
        let count = entry.access_count;
        if count == self.k {
            // graduated: move from the history list to the cache list
            Self::detach(&mut self.history, frame_id);
            self.cache.push_front(frame_id);
        } else if count > self.k {
            Self::detach(&mut self.cache, frame_id);
            self.cache.push_front(frame_id);
        } else if count == 1 {
            self.history.push_front(frame_id);
        }
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let evictable = |frame_id: &&FrameId| {
            self.entries
                .get(*frame_id)
                .map_or(false, |entry| entry.evictable)
        };
        let victim = self
            .history
            .iter()
            .rev()
            .find(evictable)
            .or_else(|| self.cache.iter().rev().find(evictable))
            .copied()?;

        Self::detach(&mut self.history, victim);
        Self::detach(&mut self.cache, victim);
        self.entries.remove(&victim);
        self.curr_size -= 1;
        trace!("evicting frame {}", victim);
        Some(victim)
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> ShaleDBResult<()> {
        self.check_frame(frame_id)?;
        // frames that were never accessed are not tracked
        let Some(entry) = self.entries.get_mut(&frame_id) else {
            return Ok(());
        };
        if entry.evictable != evictable {
            entry.evictable = evictable;
            if evictable {
                self.curr_size += 1;
            } else {
                self.curr_size -= 1;
            }
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) -> ShaleDBResult<()> {
        let Some(entry) = self.entries.get(&frame_id) else {
            return Ok(());
        };
        if !entry.evictable {
            return Err(ShaleDBError::Internal(format!(
                "cannot remove pinned frame {}",
                frame_id
            )));
        }
        Self::detach(&mut self.history, frame_id);
        Self::detach(&mut self.cache, frame_id);
        self.entries.remove(&frame_id);
        self.curr_size -= 1;
        Ok(())
    }

    fn size(&self) -> usize {
        self.curr_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evictable_tracks_size() {
        let mut replacer = LRUKReplacer::new(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        // repeated toggles do not double count
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);
        // never-accessed frames are ignored
        replacer.set_evictable(2, true).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn history_evicted_before_cache() {
        let mut replacer = LRUKReplacer::new(8, 2);
        // frames 1 and 2 reach K accesses, frame 3 stays in history
        for frame in [1, 2, 3, 1, 2] {
            replacer.record_access(frame).unwrap();
        }
        for frame in [1, 2, 3] {
            replacer.set_evictable(frame, true).unwrap();
        }
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(3));
        // within the cache list the least recently moved frame goes first
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn evict_skips_pinned_frames() {
        let mut replacer = LRUKReplacer::new(4, 2);
        replacer.record_access(0).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        // frame 0 is older but not evictable
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn eviction_resets_access_history() {
        let mut replacer = LRUKReplacer::new(4, 2);
        replacer.record_access(1).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.evict(), Some(1));

        // the frame starts over in the history list
        replacer.record_access(2).unwrap();
        replacer.record_access(2).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn remove_requires_evictable() {
        let mut replacer = LRUKReplacer::new(4, 2);
        replacer.record_access(1).unwrap();
        assert!(replacer.remove(1).is_err());
        replacer.set_evictable(1, true).unwrap();
        assert!(replacer.remove(1).is_ok());
        assert_eq!(replacer.size(), 0);
        // removing an untracked frame is a no-op
        assert!(replacer.remove(1).is_ok());
    }

    #[test]
    fn record_access_rejects_out_of_range_frames() {
        let mut replacer = LRUKReplacer::new(2, 2);
        assert!(replacer.record_access(2).is_err());
        assert!(replacer.set_evictable(2, true).is_err());
        assert!(replacer.record_access(1).is_ok());
    }
}
