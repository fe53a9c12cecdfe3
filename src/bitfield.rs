//! The bit-indexed set of piece indices a peer advertises as available.

use bitvec::prelude::{BitVec, Msb0};

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector from most significant to least significant
/// bits, that is, where the highest bit of the first byte represents the
/// first piece, the second highest bit the second piece, and so on (e.g.
/// `0b1100_0001` would mean that the peer has pieces 0, 1, and 7). A truthy
/// value at a piece's position means the peer has the piece, a falsy value
/// means it doesn't.
pub type Bitfield = BitVec<u8, Msb0>;

/// Builds an all-unset bitfield sized for `piece_count` pieces.
pub fn empty(piece_count: usize) -> Bitfield {
    Bitfield::repeat(false, piece_count)
}

/// Fits a bitfield received from the wire to the expected piece count.
///
/// A peer's bitfield is padded up to a whole number of bytes on the wire, so
/// its bit length may exceed `piece_count`; per the design, the padding bits'
/// value is undefined and we simply discard them rather than validate them.
/// If the incoming bitfield is shorter than expected it is zero-extended, so
/// a peer cannot accidentally gain bits past what it announced.
pub fn fit_to_piece_count(bitfield: &mut Bitfield, piece_count: usize) {
    bitfield.resize(piece_count, false);
}
