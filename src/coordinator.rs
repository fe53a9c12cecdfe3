//! The `Coordinator` ties together the three work queues, the piece
//! collector, and the live peer sessions. It is the sole mutator of all of
//! that state, receiving every state change as an [`Event`][crate::peer]
//! over a single channel rather than being called into directly.

use std::collections::HashMap;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::conf::CoordinatorConf;
use crate::error::Result;
use crate::metainfo::Descriptor;
use crate::peer::{self, PeerSession};
use crate::queue::{Idle, Pending, Unclaimed};
use crate::{Bitfield, PieceCollector, PieceWork};

pub struct Coordinator {
    descriptor: Descriptor,
    conf: CoordinatorConf,
    unclaimed: Unclaimed,
    pending: Pending,
    idle: Idle,
    peer_bitfields: HashMap<SocketAddr, Bitfield>,
    senders: HashMap<SocketAddr, peer::Sender>,
    collector: PieceCollector,
    events_tx: peer::EventSender,
    events_rx: peer::EventReceiver,
}

impl Coordinator {
    /// Builds a coordinator for a validated descriptor.
    ///
    /// The descriptor itself was already validated by
    /// [`Descriptor::from_metainfo`]; this constructor only derives the
    /// initial *unclaimed* queue from it.
    pub fn new(descriptor: Descriptor, conf: CoordinatorConf) -> Self {
        let piece_count = descriptor.piece_count();
        let unclaimed = Unclaimed::new(piece_count, |i| {
            descriptor
                .piece_len(i)
                .expect("index within piece_count always has a length")
        });
        let collector = PieceCollector::new(piece_count);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            descriptor,
            conf,
            unclaimed,
            pending: Pending::default(),
            idle: Idle::default(),
            peer_bitfields: HashMap::new(),
            senders: HashMap::new(),
            collector,
            events_tx,
            events_rx,
        }
    }

    /// Spawns an outbound session to `addr` and registers its command
    /// sender so the coordinator can later assign work or disconnect it.
    fn connect(&mut self, addr: SocketAddr) {
        let (session, tx) = PeerSession::outbound(
            addr,
            self.conf.clone(),
            self.descriptor.infohash,
            self.descriptor.piece_count(),
            self.events_tx.clone(),
        );
        self.senders.insert(addr, tx);
        tokio::spawn(session.start());
    }

    /// Connects to every peer in `peers` and drives the download to
    /// completion, streaming validated pieces to `output` in piece-index
    /// order.
    ///
    /// Returns once every session has closed and the collector has written
    /// every piece, or immediately if `peers` is empty.
    pub async fn run<W>(mut self, peers: impl IntoIterator<Item = SocketAddr>, mut output: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for addr in peers {
            self.connect(addr);
        }
        if self.senders.is_empty() {
            return Ok(());
        }

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event, &mut output).await?;
            if self.senders.is_empty() && self.collector.is_complete() {
                break;
            }
        }
        log::info!("download complete: {} pieces written", self.descriptor.piece_count());
        Ok(())
    }

    async fn handle_event<W>(&mut self, event: peer::Event, output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            peer::Event::Ready { addr, bitfield } => {
                self.peer_bitfields.insert(addr, bitfield);
                self.idle.insert(addr);
                self.run_assignment_policy();
            }
            peer::Event::PieceComplete { addr, work, buf } => {
                self.pending.remove(addr);
                if Self::hash_matches(&self.descriptor, work.index, &buf) {
                    if !self.collector.contains(work.index) {
                        self.collector.collect(work.index, buf);
                        self.collector.write_ready(output).await?;
                        log::info!(
                            "{:.1}% complete (piece {}, {} peers connected)",
                            self.collector.percent_complete() * 100.0,
                            work.index,
                            self.senders.len()
                        );
                    }
                } else {
                    log::debug!("peer {} sent piece {} with a bad hash", addr, work.index);
                    if !self.collector.contains(work.index) && !self.pending.contains_index(work.index) {
                        self.unclaimed.requeue(work);
                    }
                }
                self.idle.insert(addr);
                self.run_assignment_policy();
                if self.collector.is_complete() {
                    self.disconnect_all();
                }
            }
            peer::Event::Closed { addr, had_assignment } => {
                self.senders.remove(&addr);
                self.peer_bitfields.remove(&addr);
                self.idle.remove(addr);
                self.pending.remove(addr);
                if let Some(work) = had_assignment {
                    if !self.collector.contains(work.index) && !self.pending.contains_index(work.index) {
                        self.unclaimed.requeue(work);
                    }
                }
            }
        }
        Ok(())
    }

    fn hash_matches(descriptor: &Descriptor, index: crate::PieceIndex, buf: &[u8]) -> bool {
        let digest = Sha1::digest(buf);
        descriptor
            .piece_hashes
            .get(index)
            .map(|expected| expected.as_slice() == digest.as_slice())
            .unwrap_or(false)
    }

    /// Hands out work to every idle peer, per the assignment policy: an
    /// unclaimed piece first, a duplicate of a slow peer's pending piece
    /// second, disconnection if neither exists.
    fn run_assignment_policy(&mut self) {
        if self.collector.is_complete() {
            return;
        }
        let addrs: Vec<SocketAddr> = self.idle.iter().copied().collect();
        for addr in addrs {
            self.idle.remove(addr);
            let Some(bitfield) = self.peer_bitfields.get(&addr) else {
                continue;
            };

            if let Some(work) = self.unclaimed.next_for(bitfield) {
                self.unclaimed.take(work);
                self.pending.insert(addr, work);
                self.send_assignment(addr, work);
                continue;
            }

            if let Some(work) = self.pending.first_reassignable(bitfield, &self.collector) {
                self.pending.insert(addr, work);
                self.send_assignment(addr, work);
                continue;
            }

            self.disconnect(addr);
        }
    }

    fn send_assignment(&self, addr: SocketAddr, work: PieceWork) {
        if let Some(tx) = self.senders.get(&addr) {
            let _ = tx.send(peer::Command::AssignWork(work));
        }
    }

    fn disconnect(&self, addr: SocketAddr) {
        if let Some(tx) = self.senders.get(&addr) {
            let _ = tx.send(peer::Command::Shutdown);
        }
    }

    fn disconnect_all(&self) {
        for tx in self.senders.values() {
            let _ = tx.send(peer::Command::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};

    fn descriptor(total_length: u64, piece_length: u64, n_pieces: usize) -> Descriptor {
        let pieces: Vec<u8> = (0..n_pieces)
            .flat_map(|i| Sha1::digest(format!("piece-{i}").as_bytes()).to_vec())
            .collect();
        let metainfo = Metainfo {
            info: Info {
                name: "sample.bin".to_string(),
                pieces,
                piece_length,
                length: Some(total_length),
                files: None,
                private: None,
            },
        };
        Descriptor::from_metainfo(&metainfo).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn assignment_policy_hands_out_unclaimed_work_to_idle_peers() {
        let descriptor = descriptor(32, 16, 2);
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.senders.insert(addr(1), tx);
        let mut bf = crate::bitfield::empty(2);
        bf.set(0, true);
        bf.set(1, true);
        coordinator.peer_bitfields.insert(addr(1), bf);
        coordinator.idle.insert(addr(1));

        coordinator.run_assignment_policy();

        assert_eq!(coordinator.pending.len(), 1);
        assert_eq!(coordinator.unclaimed.len(), 1);
        match rx.try_recv() {
            Ok(peer::Command::AssignWork(work)) => assert_eq!(work.index, 0),
            _ => panic!("expected an AssignWork command"),
        }
    }

    #[test]
    fn assignment_policy_disconnects_a_peer_with_no_usable_piece() {
        let descriptor = descriptor(32, 16, 2);
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.senders.insert(addr(1), tx);
        // empty bitfield: peer has nothing
        coordinator
            .peer_bitfields
            .insert(addr(1), crate::bitfield::empty(2));
        coordinator.idle.insert(addr(1));

        coordinator.run_assignment_policy();

        assert!(coordinator.pending.len() == 0);
        match rx.try_recv() {
            Ok(peer::Command::Shutdown) => {}
            _ => panic!("expected a Shutdown command"),
        }
    }

    #[test]
    fn assignment_policy_duplicates_a_pending_piece_near_completion() {
        let descriptor = descriptor(16, 16, 1);
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        coordinator.senders.insert(addr(1), tx_a);
        coordinator.senders.insert(addr(2), tx_b);

        let mut bf = crate::bitfield::empty(1);
        bf.set(0, true);
        coordinator.peer_bitfields.insert(addr(1), bf.clone());
        coordinator.peer_bitfields.insert(addr(2), bf);

        // peer 1 already holds the only piece
        coordinator.idle.insert(addr(1));
        coordinator.run_assignment_policy();
        assert_eq!(coordinator.pending.len(), 1);

        // peer 2 goes idle with nothing left unclaimed: it should get a
        // redundant assignment to the same piece rather than a disconnect
        coordinator.idle.insert(addr(2));
        coordinator.run_assignment_policy();
        assert_eq!(coordinator.pending.len(), 2);
        match rx_b.try_recv() {
            Ok(peer::Command::AssignWork(work)) => assert_eq!(work.index, 0),
            _ => panic!("expected peer 2 to get a redundant assignment"),
        }
    }

    #[tokio::test]
    async fn piece_complete_with_bad_hash_requeues_and_keeps_peer() {
        let descriptor = descriptor(16, 16, 1);
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        coordinator.senders.insert(addr(1), tx);
        coordinator.pending.insert(addr(1), PieceWork { index: 0, size: 16 });

        let mut out = Vec::new();
        coordinator
            .handle_event(
                peer::Event::PieceComplete {
                    addr: addr(1),
                    work: PieceWork { index: 0, size: 16 },
                    buf: vec![0xFF; 16],
                },
                &mut out,
            )
            .await
            .unwrap();

        assert!(!coordinator.collector.contains(0));
        assert_eq!(coordinator.unclaimed.len(), 1);
        assert!(coordinator.senders.contains_key(&addr(1)));
    }

    #[tokio::test]
    async fn piece_complete_with_good_hash_is_written_and_not_requeued() {
        let descriptor = descriptor(16, 16, 1);
        let expected_hash = descriptor.piece_hashes[0];
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        coordinator.pending.insert(addr(1), PieceWork { index: 0, size: 16 });

        // brute-force a buffer whose SHA-1 matches: since the fixture derives
        // hashes from "piece-{i}", reuse that content directly.
        let buf = b"piece-0".to_vec();
        let digest = Sha1::digest(&buf);
        assert_eq!(digest.as_slice(), expected_hash);

        let mut out = Vec::new();
        coordinator
            .handle_event(
                peer::Event::PieceComplete { addr: addr(1), work: PieceWork { index: 0, size: 16 }, buf },
                &mut out,
            )
            .await
            .unwrap();

        assert!(coordinator.collector.contains(0));
        assert_eq!(coordinator.unclaimed.len(), 0);
        assert_eq!(out, b"piece-0".to_vec());
    }

    #[tokio::test]
    async fn closed_with_assignment_requeues_when_no_one_else_holds_it() {
        let descriptor = descriptor(32, 16, 2);
        let mut coordinator = Coordinator::new(descriptor, CoordinatorConf::default());
        coordinator.unclaimed.take(PieceWork { index: 1, size: 16 });
        coordinator.pending.insert(addr(1), PieceWork { index: 1, size: 16 });

        let mut out = Vec::new();
        coordinator
            .handle_event(
                peer::Event::Closed { addr: addr(1), had_assignment: Some(PieceWork { index: 1, size: 16 }) },
                &mut out,
            )
            .await
            .unwrap();

        assert_eq!(coordinator.unclaimed.len(), 2);
        assert_eq!(coordinator.pending.len(), 0);
    }
}
