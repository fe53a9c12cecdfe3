//! A single peer connection: the wire protocol session and the per-peer
//! state machine driving it.
//!
//! The session owns exactly one socket and runs as its own task, exchanging
//! events with the coordinator over channels rather than being called into
//! directly — the Rust-native form of the design's "post a command, don't
//! call into the session synchronously" discipline.

pub(crate) mod codec;

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{bitfield, conf::CoordinatorConf, peer::codec::*, Bitfield, PieceIndex, PieceWork, Sha1Hash};

/// Commands the coordinator sends to a running peer session.
pub(crate) enum Command {
    /// Assigns a new piece to download, replacing any prior assignment.
    AssignWork(PieceWork),
    /// Tears down the session.
    Shutdown,
}

pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Events a peer session reports back to the coordinator.
pub(crate) enum Event {
    /// The handshake and bitfield exchange completed successfully.
    Ready { addr: SocketAddr, bitfield: Bitfield },
    /// A full piece was downloaded and is ready for hash validation.
    PieceComplete { addr: SocketAddr, work: PieceWork, buf: Vec<u8> },
    /// The session ended, for any reason (error, timeout, explicit
    /// shutdown). If it held an assignment when it closed, it is returned so
    /// the coordinator can requeue it.
    Closed { addr: SocketAddr, had_assignment: Option<PieceWork> },
}

pub(crate) type EventSender = UnboundedSender<Event>;
pub(crate) type EventReceiver = UnboundedReceiver<Event>;

/// The state a session moves through from connection to teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    Working,
}

/// The piece this session is currently downloading from its peer.
struct Assignment {
    work: PieceWork,
    buf: Vec<u8>,
    downloaded: u32,
    requested: u32,
    backlog: u32,
}

impl Assignment {
    fn new(work: PieceWork) -> Self {
        Self {
            work,
            buf: vec![0u8; work.size as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

pub(crate) struct PeerSession {
    addr: SocketAddr,
    conf: CoordinatorConf,
    info_hash: Sha1Hash,
    piece_count: usize,
    cmd_port: Receiver,
    events: EventSender,
    state: State,
    choked: bool,
    peer_bitfield: Bitfield,
    assignment: Option<Assignment>,
}

impl PeerSession {
    /// Creates a new outbound session for `addr` and returns it alongside its
    /// command sender, which the coordinator keeps to drive assignment and
    /// shutdown.
    pub(crate) fn outbound(
        addr: SocketAddr,
        conf: CoordinatorConf,
        info_hash: Sha1Hash,
        piece_count: usize,
        events: EventSender,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                addr,
                conf,
                info_hash,
                piece_count,
                cmd_port,
                events,
                state: State::Connecting,
                choked: true,
                peer_bitfield: bitfield::empty(piece_count),
                assignment: None,
            },
            cmd_chan,
        )
    }

    /// Runs the session to completion and reports its outcome to the
    /// coordinator. Never panics on peer misbehavior: every failure mode is
    /// local to the session and reported via an [`Event::Closed`].
    pub(crate) async fn start(mut self) {
        let had_assignment = self.run().await;
        log::info!("Peer {} session closed", self.addr);
        let _ = self.events.send(Event::Closed {
            addr: self.addr,
            had_assignment,
        });
    }

    /// Returns the piece this session was working on, if any, so `start` can
    /// report it in the `Closed` event.
    async fn run(&mut self) -> Option<PieceWork> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = match timeout(self.conf.connect_timeout, TcpStream::connect(self.addr)).await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                log::debug!("Peer {} connect error: {}", self.addr, e);
                return None;
            }
            Err(_) => {
                log::debug!("Peer {} connect timed out", self.addr);
                return None;
            }
        };
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);
        self.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.conf.client_id);
        log::info!("Sending handshake to peer {}", self.addr);

        let handshake_exchange = async {
            socket.send(handshake).await?;
            socket.next().await.ok_or(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before handshake",
            )))?
        };

        let peer_handshake = match timeout(self.conf.handshake_timeout, handshake_exchange).await {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                log::debug!("Peer {} handshake error: {}", self.addr, e);
                return None;
            }
            Err(_) => {
                log::debug!("Peer {} handshake timed out", self.addr);
                return None;
            }
        };

        if peer_handshake.info_hash != self.info_hash {
            log::debug!("Peer {} sent mismatched infohash, closing", self.addr);
            return None;
        }

        // switch codecs, carrying over any bytes the peer already sent past
        // the handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state = State::AwaitingBitfield;
        self.await_bitfield(socket).await
    }

    async fn await_bitfield(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Option<PieceWork> {
        let msg = match timeout(self.conf.handshake_timeout, socket.next()).await {
            Ok(Some(Ok(msg))) => msg,
            _ => {
                log::debug!("Peer {} did not send a bitfield in time", self.addr);
                return None;
            }
        };

        let mut bf = match msg {
            Message::Bitfield(bf) => bf,
            other => {
                log::debug!(
                    "Peer {} sent {:?} instead of a bitfield, closing",
                    self.addr,
                    other.id()
                );
                return None;
            }
        };
        bitfield::fit_to_piece_count(&mut bf, self.piece_count);
        self.peer_bitfield = bf.clone();

        if socket.send(Message::Unchoke).await.is_err()
            || socket.send(Message::Interested).await.is_err()
        {
            return None;
        }

        self.state = State::Ready;
        log::info!("Peer {} session ready", self.addr);
        if self
            .events
            .send(Event::Ready { addr: self.addr, bitfield: bf })
            .is_err()
        {
            return None;
        }

        self.drive(socket).await
    }

    /// The main loop once the session is `Ready`/`Working`: select between
    /// inbound wire messages and commands from the coordinator.
    async fn drive(&mut self, mut socket: Framed<TcpStream, PeerCodec>) -> Option<PieceWork> {
        loop {
            tokio::select! {
                msg = socket.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            if self.handle_message(&mut socket, msg).await.is_err() {
                                return self.assignment.take().map(|a| a.work);
                            }
                        }
                        Some(Err(e)) => {
                            log::debug!("Peer {} framing error: {}", self.addr, e);
                            return self.assignment.take().map(|a| a.work);
                        }
                        None => {
                            log::debug!("Peer {} closed the connection", self.addr);
                            return self.assignment.take().map(|a| a.work);
                        }
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::AssignWork(work)) => {
                            self.assign_work(&mut socket, work).await;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down peer {} session", self.addr);
                            return self.assignment.take().map(|a| a.work);
                        }
                    }
                }
            }
        }
    }

    async fn assign_work(&mut self, socket: &mut Framed<TcpStream, PeerCodec>, work: PieceWork) {
        log::debug!("Peer {} assigned piece {}", self.addr, work.index);
        self.state = State::Working;
        self.assignment = Some(Assignment::new(work));
        self.pump_requests(socket).await;
    }

    /// Issues REQUEST messages until the backlog is full or the piece's
    /// remaining bytes are all already requested.
    async fn pump_requests(&mut self, socket: &mut Framed<TcpStream, PeerCodec>) {
        if self.choked {
            return;
        }
        let Some(assignment) = self.assignment.as_mut() else {
            return;
        };

        while assignment.backlog < self.conf.max_backlog
            && assignment.requested < assignment.work.size
        {
            let remaining = assignment.work.size - assignment.requested;
            let len = remaining.min(self.conf.block_len);
            let req = Message::Request {
                piece_index: assignment.work.index,
                offset: assignment.requested,
                len,
            };
            if socket.send(req).await.is_err() {
                return;
            }
            assignment.requested += len;
            assignment.backlog += 1;
        }
    }

    /// Handles one inbound message. Returns `Err(())` to signal the session
    /// must close (the fatal condition has already been logged by the
    /// caller).
    async fn handle_message(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<(), ()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.choked = true;
            }
            Message::Unchoke => {
                self.choked = false;
                self.pump_requests(socket).await;
            }
            Message::Interested | Message::NotInterested => {
                // this client never seeds, so peer interest is informational only
            }
            Message::Have { piece_index } => {
                if piece_index < self.peer_bitfield.len() {
                    self.peer_bitfield.set(piece_index, true);
                }
            }
            Message::Bitfield(_) => {
                log::debug!("Peer {} sent a second bitfield, ignoring", self.addr);
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                // this client never seeds, so it never serves blocks
            }
            Message::Piece { piece_index, offset, data } => {
                self.handle_piece(piece_index, offset, data);
            }
        }
        Ok(())
    }

    fn handle_piece(&mut self, piece_index: PieceIndex, offset: u32, data: Vec<u8>) {
        let Some(assignment) = self.assignment.as_mut() else {
            log::debug!("Peer {} sent a block with no active assignment", self.addr);
            return;
        };
        if piece_index != assignment.work.index {
            log::debug!(
                "Peer {} sent a block for piece {} while working piece {}",
                self.addr,
                piece_index,
                assignment.work.index
            );
            return;
        }

        let start = offset as usize;
        let end = start + data.len();
        if end > assignment.buf.len() {
            log::debug!("Peer {} sent an out-of-bounds block, ignoring", self.addr);
            return;
        }
        assignment.buf[start..end].copy_from_slice(&data);
        assignment.downloaded += data.len() as u32;
        assignment.backlog = assignment.backlog.saturating_sub(1);

        if assignment.downloaded == assignment.work.size {
            let assignment = self.assignment.take().unwrap();
            self.state = State::Ready;
            log::info!(
                "Finished piece {} via peer {}",
                assignment.work.index,
                self.addr
            );
            let _ = self.events.send(Event::PieceComplete {
                addr: self.addr,
                work: assignment.work,
                buf: assignment.buf,
            });
            // deliberately do not pump requests here: the next pump is
            // driven by the coordinator's subsequent `AssignWork`
        }
    }
}
