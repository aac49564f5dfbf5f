//! Piece-level progress classification for the UI collaborator.
//!
//! The interval views are projected onto fixed-size pieces so a progress
//! bar can paint each piece by state.

use crate::range_set::{ByteRange, RangeSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PieceState {
    /// Every byte of the piece is written to disk.
    Downloaded,
    /// Some byte of the piece is leased to an in-flight worker.
    Active,
    /// Some but not all bytes are written, nothing in flight.
    Partial,
    /// Nothing written, but some source offers the piece in full.
    Available,
    /// No known source offers all of the piece.
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiecesInfo {
    pub piece_size: u64,
    pub states: Vec<PieceState>,
    pub num_completed: u64,
}

impl PiecesInfo {
    pub fn num_pieces(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, index: usize) -> Option<PieceState> {
        self.states.get(index).copied()
    }
}

/// Classifies each piece of a `length`-byte file against the written,
/// active and available views. The trailing partial piece is classified
/// like any other; indexes past the end of the file are not reported.
pub fn classify(
    written: &RangeSet,
    active: &RangeSet,
    available: &RangeSet,
    piece_size: u64,
    length: u64,
) -> PiecesInfo {
    assert!(piece_size > 0, "piece size must be positive");
    let mut states = Vec::new();
    let mut start = 0;
    while start < length {
        let piece = ByteRange::new(start, (start + piece_size).min(length));
        states.push(classify_piece(written, active, available, &piece));
        start = piece.end;
    }
    PiecesInfo {
        piece_size,
        states,
        num_completed: written.total_bytes() / piece_size,
    }
}

fn classify_piece(
    written: &RangeSet,
    active: &RangeSet,
    available: &RangeSet,
    piece: &ByteRange,
) -> PieceState {
    if written.covers(piece) {
        PieceState::Downloaded
    } else if active.overlaps(piece) {
        PieceState::Active
    } else if written.overlaps(piece) {
        PieceState::Partial
    } else if available.covers(piece) {
        PieceState::Available
    } else {
        PieceState::Unavailable
    }
}
