use anyhow::Result;

use crate::store::{CursorId, Direction, StoreTxn};

/// Thresholds of the sequential-read heuristic, in block keys.
#[derive(Debug, Clone, Copy)]
pub struct ReadTuning {
    pub sequential_span: i64,
    pub cursor_window: i64,
}

impl Default for ReadTuning {
    fn default() -> Self {
        Self {
            sequential_span: 10,
            cursor_window: 100,
        }
    }
}

/// The last three keyed reads.
#[derive(Debug, Default, Clone)]
pub struct ReadHistory {
    recent: [i64; 3],
    len: usize,
}

impl ReadHistory {
    pub fn push(&mut self, key: i64) {
        self.recent.rotate_left(1);
        self.recent[2] = key;
        self.len = (self.len + 1).min(3);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn direction(&self, span: i64) -> Option<Direction> {
        if self.len < 3 {
            return None;
        }
        let [a, b, c] = self.recent;
        if a < b && b < c && c - a < span {
            return Some(Direction::Forward);
        }
        if a > b && b > c && a - c < span {
            return Some(Direction::Backward);
        }
        None
    }
}

#[derive(Debug)]
pub struct CursorState {
    id: CursorId,
    direction: Direction,
    key: i64,
    pending: Option<(i64, Vec<u8>)>,
    exhausted: bool,
}

impl CursorState {
    pub fn new(id: CursorId, direction: Direction, key: i64) -> Self {
        Self {
            id,
            direction,
            key,
            pending: None,
            exhausted: false,
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    /// Whether `key` is a short step past the cursor in its direction.
    pub fn accepts(&self, key: i64, window: i64) -> bool {
        match self.direction {
            Direction::Forward => key > self.key && key < self.key.saturating_add(window),
            Direction::Backward => key < self.key && key > self.key.saturating_sub(window),
        }
    }

    fn behind(&self, record_key: i64, target: i64) -> bool {
        match self.direction {
            Direction::Forward => record_key < target,
            Direction::Backward => record_key > target,
        }
    }

    /// Advances to `key`, returning its record if the store has one.
    pub async fn read<T: StoreTxn>(&mut self, txn: &mut T, key: i64) -> Result<Option<Vec<u8>>> {
        while !self.exhausted
            && self
                .pending
                .as_ref()
                .map_or(true, |(record_key, _)| self.behind(*record_key, key))
        {
            self.pending = txn.cursor_next(self.id).await?;
            self.exhausted = self.pending.is_none();
        }
        self.key = key;
        Ok(self
            .pending
            .as_ref()
            .filter(|(record_key, _)| *record_key == key)
            .map(|(_, value)| value.clone()))
    }
}

/// How the next block read is served.
#[derive(Debug, Default)]
pub enum ReadStrategy {
    #[default]
    Keyed,
    ForwardCursor(CursorState),
    BackwardCursor(CursorState),
}

impl ReadStrategy {
    pub fn cursor(direction: Direction, state: CursorState) -> Self {
        match direction {
            Direction::Forward => Self::ForwardCursor(state),
            Direction::Backward => Self::BackwardCursor(state),
        }
    }

    pub fn cursor_mut(&mut self) -> Option<&mut CursorState> {
        match self {
            Self::Keyed => None,
            Self::ForwardCursor(state) | Self::BackwardCursor(state) => Some(state),
        }
    }

    pub fn is_cursor(&self) -> bool {
        !matches!(self, Self::Keyed)
    }

    /// Drops the cursor (if any) and goes back to keyed reads.
    pub fn reset<T: StoreTxn>(&mut self, txn: Option<&mut T>) {
        if let Self::ForwardCursor(state) | Self::BackwardCursor(state) = std::mem::take(self) {
            if let Some(txn) = txn {
                txn.close_cursor(state.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(keys: &[i64]) -> ReadHistory {
        let mut history = ReadHistory::default();
        for key in keys {
            history.push(*key);
        }
        history
    }

    #[test]
    fn needs_three_reads() {
        assert_eq!(history(&[1, 2]).direction(10), None);
        assert_eq!(history(&[1, 2, 3]).direction(10), Some(Direction::Forward));
    }

    #[test]
    fn detects_backward_and_ignores_wide_or_mixed_runs() {
        assert_eq!(history(&[9, 7, 4]).direction(10), Some(Direction::Backward));
        assert_eq!(history(&[0, 5, 10]).direction(10), None);
        assert_eq!(history(&[1, 3, 2]).direction(10), None);
        assert_eq!(history(&[4, 4, 5]).direction(10), None);
        assert_eq!(history(&[100, 1, 2, 3]).direction(10), Some(Direction::Forward));
    }

    #[test]
    fn cursor_window_is_directional() {
        let forward = CursorState::new(CursorId(0), Direction::Forward, 10);
        assert!(forward.accepts(11, 100));
        assert!(forward.accepts(109, 100));
        assert!(!forward.accepts(110, 100));
        assert!(!forward.accepts(10, 100));
        assert!(!forward.accepts(9, 100));

        let backward = CursorState::new(CursorId(0), Direction::Backward, 10);
        assert!(backward.accepts(9, 100));
        assert!(!backward.accepts(11, 100));
    }
}
