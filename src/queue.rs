//! The three work-tracking collections the coordinator owns and mutates: the
//! *unclaimed* set of pieces nobody is downloading, the *pending* sequence of
//! peers with an outstanding assignment, and the *idle* set of peers ready
//! for more work.
//!
//! These are plain, non-thread-safe collections on purpose: the coordinator
//! is their only mutator, so no locking is needed, mirroring how the
//! teacher's torrent state keeps its piece picker un-synchronized and lets
//! a single task own it.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use crate::{PieceIndex, PieceWork};

/// Pieces that are not currently assigned to any peer.
///
/// A plain `VecDeque` rather than a set: the coordinator always hands out the
/// piece at the front, so pieces are downloaded in roughly ascending index
/// order, which keeps the collector's write-ahead backlog small.
#[derive(Default)]
pub(crate) struct Unclaimed {
    queue: VecDeque<PieceWork>,
}

impl Unclaimed {
    /// Builds the initial queue holding every piece in the torrent.
    pub(crate) fn new(piece_count: usize, piece_len: impl Fn(PieceIndex) -> u32) -> Self {
        let queue = (0..piece_count)
            .map(|index| PieceWork { index, size: piece_len(index) })
            .collect();
        Self { queue }
    }

    /// Returns the next piece a peer could work on that is not already in
    /// `peer_has`, without removing it.
    pub(crate) fn next_for(&self, peer_has: &crate::Bitfield) -> Option<PieceWork> {
        self.queue
            .iter()
            .find(|work| peer_has.get(work.index).map(|b| *b).unwrap_or(false))
            .copied()
    }

    /// Removes and returns the given piece, if present.
    pub(crate) fn take(&mut self, work: PieceWork) -> Option<PieceWork> {
        let pos = self.queue.iter().position(|w| *w == work)?;
        self.queue.remove(pos)
    }

    /// Returns a piece to the queue, e.g. after a peer holding it disconnects.
    ///
    /// Pushed to the front so that abandoned work is retried before the
    /// queue moves further along the index space.
    pub(crate) fn requeue(&mut self, work: PieceWork) {
        if !self.queue.contains(&work) {
            self.queue.push_front(work);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Peers with an outstanding piece assignment, in the order they were
/// assigned.
///
/// Exposed as a sequence (not a map) because the coordinator never looks one
/// up by address outside of completion/disconnection, both of which are rare
/// relative to how often peers churn through `Idle`.
#[derive(Default)]
pub(crate) struct Pending {
    assignments: VecDeque<(SocketAddr, PieceWork)>,
}

impl Pending {
    pub(crate) fn insert(&mut self, addr: SocketAddr, work: PieceWork) {
        self.assignments.push_back((addr, work));
    }

    /// Removes and returns the assignment held by `addr`, if any.
    pub(crate) fn remove(&mut self, addr: SocketAddr) -> Option<PieceWork> {
        let pos = self.assignments.iter().position(|(a, _)| *a == addr)?;
        self.assignments.remove(pos).map(|(_, work)| work)
    }

    /// Returns whether any entry is currently assigned piece `index`.
    pub(crate) fn contains_index(&self, index: PieceIndex) -> bool {
        self.assignments.iter().any(|(_, w)| w.index == index)
    }

    /// Finds the first pending piece a peer could pick up as a redundant,
    /// second assignment: one it has (per its bitfield) and the collector
    /// doesn't have yet.
    pub(crate) fn first_reassignable(
        &self,
        peer_has: &crate::Bitfield,
        collector: &crate::PieceCollector,
    ) -> Option<PieceWork> {
        self.assignments
            .iter()
            .map(|(_, w)| *w)
            .find(|w| !collector.contains(w.index) && peer_has.get(w.index).map(|b| *b).unwrap_or(false))
    }

    pub(crate) fn len(&self) -> usize {
        self.assignments.len()
    }
}

/// Peers that have completed their handshake and hold no assignment.
#[derive(Default)]
pub(crate) struct Idle {
    peers: HashSet<SocketAddr>,
}

impl Idle {
    pub(crate) fn insert(&mut self, addr: SocketAddr) {
        self.peers.insert(addr);
    }

    pub(crate) fn remove(&mut self, addr: SocketAddr) -> bool {
        self.peers.remove(&addr)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn unclaimed_hands_out_in_index_order() {
        let q = Unclaimed::new(3, |_| 100);
        let mut bf = crate::bitfield::empty(3);
        for i in 0..3 {
            bf.set(i, true);
        }
        assert_eq!(q.next_for(&bf), Some(PieceWork { index: 0, size: 100 }));
    }

    #[test]
    fn unclaimed_skips_pieces_the_peer_lacks() {
        let q = Unclaimed::new(3, |_| 100);
        let mut bf = crate::bitfield::empty(3);
        bf.set(0, false);
        bf.set(1, true);
        bf.set(2, false);
        assert_eq!(q.next_for(&bf), Some(PieceWork { index: 1, size: 100 }));
    }

    #[test]
    fn unclaimed_take_removes_exactly_once() {
        let mut q = Unclaimed::new(2, |_| 100);
        let taken = q.take(PieceWork { index: 0, size: 0 }).unwrap();
        assert_eq!(taken.index, 0);
        assert!(q.take(PieceWork { index: 0, size: 0 }).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn unclaimed_requeue_does_not_duplicate() {
        let mut q = Unclaimed::new(1, |_| 100);
        let work = q.take(PieceWork { index: 0, size: 0 }).unwrap();
        q.requeue(work);
        q.requeue(work);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pending_tracks_one_assignment_per_peer() {
        let mut p = Pending::default();
        p.insert(addr(1), PieceWork { index: 0, size: 10 });
        assert_eq!(p.len(), 1);
        let removed = p.remove(addr(1)).unwrap();
        assert_eq!(removed.index, 0);
        assert!(p.remove(addr(1)).is_none());
    }

    #[test]
    fn idle_insert_and_remove() {
        let mut idle = Idle::default();
        idle.insert(addr(1));
        assert!(!idle.is_empty());
        assert!(idle.remove(addr(1)));
        assert!(idle.is_empty());
    }
}
