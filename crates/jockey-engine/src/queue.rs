use crate::error::EngineError;
use jockey_proto::track::{LoopMode, Track};
use rand::seq::SliceRandom;
use rand::Rng;

/// Ordered track list with a cursor on the playing entry.
///
/// Shuffle is a derived permutation over the not-yet-played indices; the
/// underlying insertion order is never destroyed, so switching shuffle off
/// resumes the original ordering from the cursor. Invariant: the cursor is
/// either `None` or a valid index.
#[derive(Debug, Default)]
pub struct Queue {
    tracks: Vec<Track>,
    played: Vec<bool>,
    cursor: Option<usize>,
    loop_mode: LoopMode,
    shuffle: bool,
    /// Upcoming indices in playback order while shuffle is on.
    shuffle_order: Vec<usize>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&Track> {
        self.cursor.map(|c| &self.tracks[c])
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    /// Appends a track, returning its index. While shuffle is on the new
    /// index lands at a random position among the upcoming entries.
    pub fn append(&mut self, track: Track) -> usize {
        let index = self.tracks.len();
        self.tracks.push(track);
        self.played.push(false);
        if self.shuffle {
            let mut rng = rand::thread_rng();
            let pos = rng.gen_range(0..=self.shuffle_order.len());
            self.shuffle_order.insert(pos, index);
        }
        index
    }

    /// Points the cursor at `index` without consulting loop/shuffle policy.
    /// Used when playback starts from a trackless state.
    pub fn jump_to(&mut self, index: usize) {
        debug_assert!(index < self.tracks.len());
        self.cursor = Some(index);
        self.shuffle_order.retain(|&i| i != index);
    }

    /// Selects the track that follows a naturally ended one, per the loop
    /// and shuffle policy. `None` signals exhaustion; the cursor is cleared
    /// in that case.
    pub fn advance_after_end(&mut self) -> Option<usize> {
        let cursor = self.cursor?;
        if self.loop_mode == LoopMode::Track {
            return Some(cursor);
        }
        self.played[cursor] = true;
        let next = self.select_next(cursor);
        self.cursor = next;
        next
    }

    /// Resolves the target of `Skip(count)`. Fails with `InvalidTarget`
    /// when the target falls off the end and loop is off; the queue is left
    /// untouched on failure. With loop=queue the result always lands in
    /// `[0, len)` for any count.
    pub fn skip_target(&mut self, count: usize) -> Result<usize, EngineError> {
        let cursor = self.cursor.ok_or(EngineError::InvalidTarget)?;
        if self.tracks.is_empty() {
            return Err(EngineError::InvalidTarget);
        }
        match self.loop_mode {
            LoopMode::Track => Ok(cursor),
            _ if self.shuffle => self.skip_shuffled(cursor, count),
            LoopMode::Queue => {
                self.played[cursor] = true;
                let target = (cursor + count) % self.tracks.len();
                self.cursor = Some(target);
                Ok(target)
            }
            LoopMode::Off => {
                let target = cursor + count;
                if target >= self.tracks.len() {
                    return Err(EngineError::InvalidTarget);
                }
                self.played[cursor] = true;
                self.cursor = Some(target);
                Ok(target)
            }
        }
    }

    fn skip_shuffled(&mut self, cursor: usize, count: usize) -> Result<usize, EngineError> {
        if count == 0 {
            return Ok(cursor);
        }
        if self.loop_mode == LoopMode::Off && count > self.shuffle_order.len() {
            return Err(EngineError::InvalidTarget);
        }
        self.played[cursor] = true;
        let mut target = cursor;
        for _ in 0..count {
            if self.shuffle_order.is_empty() {
                // Wrap point: fresh permutation over the whole queue.
                self.reset_for_wrap(target);
            }
            if self.shuffle_order.is_empty() {
                // Single-entry queue: wrapping lands back on the same track.
                break;
            }
            target = self.shuffle_order.remove(0);
            self.played[target] = true;
        }
        self.played[target] = false;
        self.cursor = Some(target);
        Ok(target)
    }

    fn select_next(&mut self, cursor: usize) -> Option<usize> {
        if self.shuffle {
            if self.shuffle_order.is_empty() {
                if self.loop_mode != LoopMode::Queue {
                    return None;
                }
                self.reset_for_wrap(cursor);
                if self.shuffle_order.is_empty() {
                    return Some(cursor);
                }
            }
            return Some(self.shuffle_order.remove(0));
        }
        let next = cursor + 1;
        if next < self.tracks.len() {
            Some(next)
        } else if self.loop_mode == LoopMode::Queue {
            for p in self.played.iter_mut() {
                *p = false;
            }
            Some(0)
        } else {
            None
        }
    }

    /// Starts a new pass over the queue: everything becomes unplayed again
    /// and a fresh permutation is derived, excluding the entry just left.
    fn reset_for_wrap(&mut self, leaving: usize) {
        for p in self.played.iter_mut() {
            *p = false;
        }
        self.played[leaving] = true;
        self.recompute_order();
    }

    /// Flips shuffle. Already-played entries keep their history; only the
    /// unplayed remainder is permuted.
    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle = !self.shuffle;
        if self.shuffle {
            self.recompute_order();
        } else {
            self.shuffle_order.clear();
        }
        self.shuffle
    }

    fn recompute_order(&mut self) {
        let mut order: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| !self.played[i] && Some(i) != self.cursor)
            .collect();
        order.shuffle(&mut rand::thread_rng());
        self.shuffle_order = order;
    }

    /// Removes the track at `index`. The playing entry cannot be removed;
    /// skip past it instead.
    pub fn remove_at(&mut self, index: usize) -> Result<Track, EngineError> {
        if index >= self.tracks.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.tracks.len(),
            });
        }
        if Some(index) == self.cursor {
            return Err(EngineError::InvalidTarget);
        }
        let track = self.tracks.remove(index);
        self.played.remove(index);
        if let Some(c) = self.cursor {
            if index < c {
                self.cursor = Some(c - 1);
            }
        }
        self.shuffle_order.retain(|&i| i != index);
        for i in self.shuffle_order.iter_mut() {
            if *i > index {
                *i -= 1;
            }
        }
        Ok(track)
    }

    /// Moves the track at `from` so it ends up at `to`.
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        let len = self.tracks.len();
        if from >= len {
            return Err(EngineError::IndexOutOfRange { index: from, len });
        }
        if to >= len {
            return Err(EngineError::IndexOutOfRange { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        let track = self.tracks.remove(from);
        self.tracks.insert(to, track);
        let played = self.played.remove(from);
        self.played.insert(to, played);

        if let Some(c) = self.cursor {
            let new_cursor = if c == from {
                to
            } else if from < c && to >= c {
                c - 1
            } else if from > c && to <= c {
                c + 1
            } else {
                c
            };
            self.cursor = Some(new_cursor);
        }
        if self.shuffle {
            self.recompute_order();
        }
        Ok(())
    }

    /// Inserts a track at the cursor position (or the tail when nothing is
    /// playing) and points the cursor at it. Used to replay history.
    pub fn insert_at_cursor(&mut self, track: Track) -> usize {
        let index = self.cursor.unwrap_or(self.tracks.len());
        self.tracks.insert(index, track);
        self.played.insert(index, false);
        for i in self.shuffle_order.iter_mut() {
            if *i >= index {
                *i += 1;
            }
        }
        self.cursor = Some(index);
        index
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.played.clear();
        self.shuffle_order.clear();
        self.cursor = None;
    }
}
