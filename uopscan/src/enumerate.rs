//! The candidate space: every `[prefix] [escape] opcode suffix` encoding.

use itertools::iproduct;

/// Legacy prefixes placed in front of a candidate.
pub const LEGACY_PREFIXES: [Option<u8>; 5] = [
    None, Some(0x66), Some(0x9b), Some(0xf2), Some(0xf3),
];

/// Escape bytes placed in front of the opcode.
pub const ESCAPES: [Option<u8>; 2] = [None, Some(0x0f)];

/// Bytes that are never used as an opcode, because the decoder treats them
/// as prefixes.
pub const PREFIX_BYTES: [u8; 28] = [
    0x2e, 0x36, 0x3e, 0x26,
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47,
    0x48, 0x49, 0x4a, 0x4b, 0x4c, 0x4d, 0x4e, 0x4f,
    0x64, 0x65, 0x66, 0x67,
    0x9b, 0xf0, 0xf2, 0xf3,
];

/// The suffix byte is `SUFFIX_BASE ^ m`, so the first suffix tried for
/// every opcode is the filler byte.
pub const SUFFIX_BASE: u8 = 0x90;

pub fn is_prefix_byte(b: u8) -> bool {
    PREFIX_BYTES.contains(&b)
}

/// A candidate encoding (at most four bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Candidate {
    bytes: [u8; 4],
    len: u8,
}
impl Candidate {
    pub fn new(prefix: Option<u8>, escape: Option<u8>, opcode: u8, suffix: u8)
        -> Self
    {
        let mut res = Self { bytes: [0; 4], len: 0 };
        for b in prefix.into_iter().chain(escape).chain([opcode, suffix]) {
            res.bytes[res.len as usize] = b;
            res.len += 1;
        }
        res
    }

    pub fn as_bytes(&self) -> &[u8] { &self.bytes[..self.len as usize] }
}

/// Number of candidates yielded by [candidates].
pub const fn candidate_count() -> usize {
    LEGACY_PREFIXES.len() * ESCAPES.len() * (256 - PREFIX_BYTES.len()) * 256
}

/// Lazily walk the candidate space: prefix outermost, suffix innermost.
pub fn candidates() -> impl Iterator<Item = Candidate> {
    iproduct!(LEGACY_PREFIXES, ESCAPES, 0u8..=0xff, 0u8..=0xff)
        .filter(|(_, _, opcode, _)| !is_prefix_byte(*opcode))
        .map(|(prefix, escape, opcode, m)| {
            Candidate::new(prefix, escape, opcode, SUFFIX_BASE ^ m)
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn order_and_shape() {
        let mut it = candidates();
        assert_eq!(it.next().unwrap().as_bytes(), &[0x00, 0x90]);
        assert_eq!(it.next().unwrap().as_bytes(), &[0x00, 0x91]);

        let c = Candidate::new(Some(0x66), Some(0x0f), 0x1f, 0x90);
        assert_eq!(c.as_bytes(), &[0x66, 0x0f, 0x1f, 0x90]);
    }

    #[test]
    fn prefixes_never_used_as_opcodes() {
        let all: Vec<Candidate> = candidates().collect();
        assert_eq!(all.len(), candidate_count());
        assert_eq!(candidate_count(), 5 * 2 * 228 * 256);

        for c in all.iter() {
            let b = c.as_bytes();
            let opcode = b[b.len() - 2];
            assert!(!is_prefix_byte(opcode), "{:02x?}", b);
        }
        assert!(all.iter().any(|c| c.as_bytes() == [0x0f, 0x1f, 0x00]));
        assert!(all.iter().any(|c| c.as_bytes() == [0xf3, 0x90, 0x90]));
    }
}
