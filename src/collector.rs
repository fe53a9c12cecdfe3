//! Accumulates completed, hash-validated pieces and streams them to the
//! output file in strict index order.
//!
//! Pieces rarely complete in index order since different peers race on
//! different pieces, so a fixed-size slot array holds completed-but-not-yet-
//! written pieces until the write cursor catches up to them.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::PieceIndex;

/// Holds downloaded piece buffers until they can be written to the output
/// file in order.
pub struct PieceCollector {
    slots: Vec<Option<Vec<u8>>>,
    /// Index of the next piece the writer is waiting on.
    write_cursor: PieceIndex,
    completed: usize,
}

impl PieceCollector {
    /// Creates a collector for a torrent with `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            slots: (0..piece_count).map(|_| None).collect(),
            write_cursor: 0,
            completed: 0,
        }
    }

    /// Returns whether `index` has already been collected.
    ///
    /// Used to guard against double-counting a piece that two peers happened
    /// to both complete before the coordinator could cancel the second
    /// assignment.
    pub fn contains(&self, index: PieceIndex) -> bool {
        self.slots.get(index).map(|s| s.is_some()).unwrap_or(false)
    }

    /// Stores a validated piece. A second `collect` for an index already
    /// held is a silent no-op: near the end of a download the coordinator
    /// may let more than one peer race to deliver the same piece, and
    /// whichever arrives first wins.
    pub fn collect(&mut self, index: PieceIndex, buf: Vec<u8>) {
        if self.slots[index].is_some() {
            log::trace!("piece {index} already collected, ignoring duplicate delivery");
            return;
        }
        self.slots[index] = Some(buf);
        self.completed += 1;
        log::trace!("collected piece {index} ({}/{})", self.completed, self.slots.len());
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.slots.len()
    }

    /// Returns the fraction of pieces collected so far, in `[0.0, 1.0]`.
    pub fn percent_complete(&self) -> f64 {
        if self.slots.is_empty() {
            return 1.0;
        }
        self.completed as f64 / self.slots.len() as f64
    }

    /// Writes every piece from the current write cursor up to the first gap,
    /// advancing the cursor and freeing the slots it wrote.
    ///
    /// Called after every `collect`, so under normal operation this writes
    /// at most one piece per call; it can write several at once if pieces
    /// complete out of order and a later call finally fills the gap.
    pub async fn write_ready<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut W,
    ) -> std::io::Result<()> {
        while self.write_cursor < self.slots.len() {
            let Some(buf) = self.slots[self.write_cursor].take() else {
                log::trace!("write cursor stalled at piece {}, still missing", self.write_cursor);
                break;
            };
            log::trace!("writing piece {} ({} bytes) to disk", self.write_cursor, buf.len());
            out.write_all(&buf).await?;
            self.write_cursor += 1;
        }
        out.flush().await?;
        if self.write_cursor == self.slots.len() {
            log::info!("all {} pieces written to disk", self.slots.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_collector_is_not_complete_unless_empty() {
        let c = PieceCollector::new(3);
        assert!(!c.is_complete());
        assert_eq!(c.percent_complete(), 0.0);

        let empty = PieceCollector::new(0);
        assert!(empty.is_complete());
    }

    #[test]
    fn collect_tracks_completion() {
        let mut c = PieceCollector::new(2);
        assert!(!c.contains(0));
        c.collect(0, vec![1, 2, 3]);
        assert!(c.contains(0));
        assert!(!c.is_complete());
        c.collect(1, vec![4, 5]);
        assert!(c.is_complete());
        assert_eq!(c.percent_complete(), 1.0);
    }

    #[tokio::test]
    async fn collecting_same_piece_twice_is_idempotent() {
        let mut c = PieceCollector::new(1);
        c.collect(0, vec![1]);
        c.collect(0, vec![2]);
        assert!(c.is_complete());
        assert_eq!(c.percent_complete(), 1.0);

        let mut out = Vec::new();
        c.write_ready(&mut out).await.unwrap();
        assert_eq!(out, vec![1], "the first delivery must win, the second must be ignored");
    }

    #[tokio::test]
    async fn write_ready_stalls_on_a_gap_and_resumes_once_filled() {
        let mut c = PieceCollector::new(3);
        let mut out = Vec::new();

        c.collect(1, vec![b'b'; 2]);
        c.write_ready(&mut out).await.unwrap();
        assert!(out.is_empty(), "piece 0 hasn't arrived yet");

        c.collect(0, vec![b'a'; 2]);
        c.write_ready(&mut out).await.unwrap();
        assert_eq!(out, vec![b'a', b'a', b'b', b'b']);

        c.collect(2, vec![b'c'; 1]);
        c.write_ready(&mut out).await.unwrap();
        assert_eq!(out, vec![b'a', b'a', b'b', b'b', b'c']);
    }
}
