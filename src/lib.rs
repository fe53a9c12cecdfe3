// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod bitfield;
pub mod collector;
pub mod conf;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod queue;

pub use bitfield::Bitfield;
pub use collector::PieceCollector;
pub use coordinator::Coordinator;
pub use engine::Engine;
pub use metainfo::{Descriptor, Metainfo};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The number of outstanding block requests a session keeps queued up with
/// a peer for the piece it is currently downloading.
pub const MAX_BACKLOG: u32 = 5;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happens at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except
    /// possibly the last block of the last piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// A unit of work handed out by the coordinator to a peer session: the index
/// of a piece and its length in bytes.
///
/// `PieceWork` is a plain value type: it is copied freely between the
/// *unclaimed* and *pending* queues rather than referenced, since its
/// identity is fully captured by `index` (see the `PartialEq` impl, which
/// intentionally ignores `size`).
#[derive(Clone, Copy, Debug)]
pub struct PieceWork {
    /// The index of the piece within the torrent.
    pub index: PieceIndex,
    /// The piece's length in bytes. Equal to the descriptor's `piece_length`
    /// for every piece except the last, which may be shorter.
    pub size: u32,
}

impl PartialEq for PieceWork {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl Eq for PieceWork {}

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`, assuming the canonical `BLOCK_LEN` block size.
///
/// # Panics
///
/// Panics if the index multiplied by the block length would exceed the piece
/// length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);

        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn piece_work_equality_is_by_index() {
        let a = PieceWork { index: 3, size: 100 };
        let b = PieceWork { index: 3, size: 999 };
        assert_eq!(a, b, "PieceWork equality must be defined by index alone");
    }
}
