pub mod config;
pub mod store;
pub mod wire;

mod session;
pub use session::{Session, SessionStatus};

pub use config::{Common, ConfigError, Roster, RosterEntry};
pub use wire::Message;

use rand::seq::SliceRandom;

/// Roster-assigned peer identity. Positive, stable for one run, and totally
/// ordered so a pair of peers can agree on who dials and who listens.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u32);

impl PeerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PeerId> for u32 {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<u32> for PeerId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceIdx(u32);

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Presence vector over the piece index space, one bit per piece.
///
/// Stored packed; the wire encoding of the BITFIELD message is unpacked (one
/// 32-bit word per piece) and lives in [`to_wire_words`](Self::to_wire_words)
/// and [`from_wire_words`](Self::from_wire_words).
#[derive(Default, Clone)]
pub struct PieceBitfield {
    data: Vec<u8>,
    size: u32,
}

impl PieceBitfield {
    /// `size` is the number of pieces tracked.
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_vec_capacity(size)];
        Self { data, size }
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        let (byte_index, bit_index) = self.get_indices(index.0);
        (self.data[byte_index] & (1 << bit_index)) > 0
    }

    pub fn set_piece(&mut self, index: PieceIdx) {
        let (byte_index, bit_index) = self.get_indices(index.0);
        self.data[byte_index] |= 1 << bit_index;
    }

    pub fn num_set(&self) -> u32 {
        self.pieces().count() as u32
    }

    pub fn fill(&mut self) {
        for i in 0..self.size {
            self.set_piece(PieceIdx::from(i));
        }
    }

    pub fn complete(&self) -> bool {
        for i in 0..self.size {
            if !self.has_piece(PieceIdx::from(i)) {
                return false;
            }
        }
        true
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Iterator over pieces that this bitfield contains
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .filter(move |p| self.has_piece(PieceIdx::new(*p)))
            .map(PieceIdx::new)
    }

    /// Pieces missing here but present in `other`.
    pub fn missing_pieces_in<'s>(&'s self, other: &'s Self) -> impl Iterator<Item = PieceIdx> + 's {
        assert_eq!(self.len(), other.len());
        (0..self.len())
            .filter(move |p| {
                let index = PieceIdx::from(*p);
                !self.has_piece(index) && other.has_piece(index)
            })
            .map(PieceIdx::new)
    }

    /// Does `other` hold at least one piece we are missing?
    pub fn interested_in(&self, other: &Self) -> bool {
        self.missing_pieces_in(other).next().is_some()
    }

    /// Uniform random pick among pieces missing here and present in `other`.
    pub fn random_missing_in<R: rand::Rng + ?Sized>(
        &self,
        other: &Self,
        rng: &mut R,
    ) -> Option<PieceIdx> {
        let candidates = self.missing_pieces_in(other).collect::<Vec<_>>();
        candidates.choose(rng).copied()
    }

    /// Wire encoding of the BITFIELD payload: one big-endian u32 per piece,
    /// value 0 or 1. Unpacked on purpose, the protocol dialect requires it.
    pub fn to_wire_words(&self) -> Vec<u8> {
        let mut words = Vec::with_capacity(self.size as usize * 4);
        for i in 0..self.size {
            let word: u32 = u32::from(self.has_piece(PieceIdx::new(i)));
            words.extend_from_slice(&word.to_be_bytes());
        }
        words
    }

    /// Inverse of [`to_wire_words`](Self::to_wire_words). `words.len()` must
    /// be a multiple of 4; the codec validates that before calling here.
    pub fn from_wire_words(words: &[u8]) -> Self {
        debug_assert_eq!(words.len() % 4, 0);
        let mut bitfield = Self::with_size((words.len() / 4) as u32);
        for (i, chunk) in words.chunks_exact(4).enumerate() {
            let word = u32::from_be_bytes(chunk.try_into().unwrap());
            if word != 0 {
                bitfield.set_piece(PieceIdx::new(i as u32));
            }
        }
        bitfield
    }

    fn piece_capacity(&self) -> u32 {
        (self.data.len() * 8) as u32
    }

    // returns (byte_index, bit_index), panics if index is invalid
    fn get_indices(&self, index: u32) -> (usize, usize) {
        if index > self.piece_capacity() {
            panic!("Bitfield not large enough for index : {}", index);
        }
        let byte_index = index as usize / 8;
        let bit_index = 7 - index as usize % 8;
        (byte_index, bit_index)
    }

    fn required_vec_capacity(num_bits: u32) -> usize {
        (num_bits / 8 + (num_bits % 8).min(1)) as usize
    }
}

impl std::fmt::Debug for PieceBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBitfield")
            .field("bits", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creation_all_zeros() {
        let bf = PieceBitfield::with_size(32);
        for i in 0..bf.len() {
            assert!(!bf.has_piece(PieceIdx::new(i)));
        }
    }

    #[test]
    fn setting_bits() {
        let mut bf = PieceBitfield::with_size(32);
        bf.set_piece(PieceIdx::new(5));
        bf.set_piece(PieceIdx::new(9));
        bf.set_piece(PieceIdx::new(30));

        assert!(bf.has_piece(PieceIdx::new(5)));
        assert!(bf.has_piece(PieceIdx::new(9)));
        assert!(bf.has_piece(PieceIdx::new(30)));
        assert_eq!(bf.num_set(), 3);

        for i in 0..bf.len() {
            assert!(!bf.has_piece(PieceIdx::new(i)) || i == 5 || i == 9 || i == 30);
        }
    }

    #[test]
    fn fill_completes() {
        let mut bf = PieceBitfield::with_size(33);
        assert!(!bf.complete());
        bf.fill();
        assert!(bf.complete());
        assert_eq!(bf.num_set(), 33);
    }

    #[test]
    fn missing_pieces_in() {
        let mut bf0 = PieceBitfield::with_size(32);
        let mut bf1 = PieceBitfield::with_size(32);

        bf0.set_piece(PieceIdx::new(5));
        bf0.set_piece(PieceIdx::new(9));
        bf0.set_piece(PieceIdx::new(30));

        bf1.set_piece(PieceIdx::new(9));

        let mut iter = bf1.missing_pieces_in(&bf0);
        assert_eq!(iter.next(), Some(PieceIdx::new(5)));
        assert_eq!(iter.next(), Some(PieceIdx::new(30)));
        assert_eq!(iter.next(), None);

        assert!(bf1.interested_in(&bf0));
        assert!(!bf0.interested_in(&bf1));
    }

    #[test]
    fn random_missing_pick_is_a_missing_piece() {
        let mut local = PieceBitfield::with_size(16);
        let mut remote = PieceBitfield::with_size(16);
        remote.fill();
        local.set_piece(PieceIdx::new(0));

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let pick = local.random_missing_in(&remote, &mut rng).unwrap();
            assert!(!local.has_piece(pick));
            assert!(remote.has_piece(pick));
        }

        local.fill();
        assert_eq!(local.random_missing_in(&remote, &mut rng), None);
    }

    #[test]
    fn wire_words_round_trip() {
        let mut bf = PieceBitfield::with_size(7);
        bf.set_piece(PieceIdx::new(0));
        bf.set_piece(PieceIdx::new(3));
        bf.set_piece(PieceIdx::new(6));

        let words = bf.to_wire_words();
        assert_eq!(words.len(), 7 * 4);
        // one 32-bit big-endian 0/1 word per piece
        assert_eq!(&words[0..4], &[0, 0, 0, 1]);
        assert_eq!(&words[4..8], &[0, 0, 0, 0]);

        let back = PieceBitfield::from_wire_words(&words);
        assert_eq!(back.len(), bf.len());
        for i in 0..bf.len() {
            assert_eq!(
                back.has_piece(PieceIdx::new(i)),
                bf.has_piece(PieceIdx::new(i))
            );
        }
    }
}
