// Per-cell presentation state machine.

use std::sync::Arc;

use image::DynamicImage;

/// What a grid cell should render right now. Exactly one state holds per index.
#[derive(Clone)]
pub enum CellState {
    /// No record exists at this index yet.
    MissingRecord,
    /// A record exists but carries no image key.
    MissingKey,
    /// Record and key known; not downloading, no result yet.
    Idle { key: String },
    /// Scheduled with the downloader, not yet transferring.
    Queued { key: String },
    /// Actively transferring.
    Active { key: String },
    /// Terminal until invalidated.
    Success {
        key: String,
        thumb: Arc<DynamicImage>,
    },
    /// Terminal until an explicit retry clears the failure entry.
    Failed { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStateKind {
    MissingRecord,
    MissingKey,
    Idle,
    Queued,
    Active,
    Success,
    Failed,
}

impl CellState {
    pub fn kind(&self) -> CellStateKind {
        match self {
            CellState::MissingRecord => CellStateKind::MissingRecord,
            CellState::MissingKey => CellStateKind::MissingKey,
            CellState::Idle { .. } => CellStateKind::Idle,
            CellState::Queued { .. } => CellStateKind::Queued,
            CellState::Active { .. } => CellStateKind::Active,
            CellState::Success { .. } => CellStateKind::Success,
            CellState::Failed { .. } => CellStateKind::Failed,
        }
    }
}

/// A tracked cell: stable index plus its current presentation state.
pub struct CellModel {
    pub index: usize,
    pub state: CellState,
}

impl CellModel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: CellState::MissingRecord,
        }
    }

    /// Asserts `next` as the cell's state. Re-asserting the variant the cell is
    /// already in is a no-op; the return value says whether anything changed,
    /// which is what gates change notifications.
    pub fn apply(&mut self, next: CellState) -> bool {
        if self.state.kind() == next.kind() {
            return false;
        }
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent_by_variant() {
        let mut cell = CellModel::new(7);
        assert!(cell.apply(CellState::Idle {
            key: "k".to_string()
        }));
        // Same variant again, even with a different key: no change.
        assert!(!cell.apply(CellState::Idle {
            key: "other".to_string()
        }));
        assert!(cell.apply(CellState::Failed {
            key: "k".to_string()
        }));
        assert_eq!(cell.state.kind(), CellStateKind::Failed);
    }
}
