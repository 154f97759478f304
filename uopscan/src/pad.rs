//! The test pad: a reusable block of executable memory holding one staged
//! candidate encoding.
//!
//! Layout of the staging slot
//! ==========================
//!
//! ```text
//! [0, padding_size)                         candidate, then FILLER
//! [padding_size, padding_size + tail_size)  tail, then FAULT
//! [padding_size + tail_size]                FAULT
//! ```
//!
//! The slot is rewritten before every measurement. Since the bytes are
//! fetched moments later, every write is followed by an explicit
//! invalidation of the surrounding window (see [TestPad::invalidate]).

use crate::asm::{ CodeArena, MeasuredFn, CACHE_LINE };
use crate::config::HarnessConfig;
use crate::error::{ HarnessError, Result };
use crate::trampoline::{ assemble_trampoline, TrampolineImage };

/// Single-byte NOP used to pad the candidate out to `padding_size`.
pub const FILLER: u8 = 0x90;

/// `INTO`, which is undefined in 64-bit mode and always faults.
pub const FAULT: u8 = 0xce;

/// Minimum size of the window (starting at the pad function) that is
/// invalidated before every sample.
pub const PAD_WINDOW: usize = 512;

/// Number of bytes at the start of the trampoline that are invalidated along
/// with the pad (they may share lines with it).
pub const TRAMPOLINE_WINDOW: usize = 128;

/// Geometry of the staging slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PadLayout {
    /// Bytes available for the candidate (and filler).
    pub padding_size: usize,
    /// Bytes available for the tail sequence.
    pub tail_size: usize,
}
impl PadLayout {
    pub const fn new(padding_size: usize, tail_size: usize) -> Self {
        Self { padding_size, tail_size }
    }

    /// 15 bytes is the longest legal encoding; 3 bytes fits `divps`.
    pub const fn x86() -> Self { Self::new(15, 3) }

    /// Total size of the slot, including the terminating fault.
    pub const fn slot_len(&self) -> usize {
        self.padding_size + self.tail_size + 1
    }
}

/// Length of the window invalidated from `window_start`, which must cover
/// the whole slot at `slot`.
fn window_len(window_start: usize, slot: usize, layout: PadLayout) -> usize {
    PAD_WINDOW.max(slot - window_start + layout.slot_len())
}

/// Length of the window invalidated from the pad function of `image`.
pub fn pad_window_len(image: &TrampolineImage, layout: PadLayout) -> usize {
    window_len(image.pad_fn, image.slot, layout)
}
impl Default for PadLayout {
    fn default() -> Self { Self::x86() }
}

/// A staging slot inside a [CodeArena], optionally attached to a trampoline
/// that can execute it.
pub struct TestPad {
    arena: CodeArena,
    layout: PadLayout,

    /// Offset of the staging slot
    slot: usize,

    /// Offset of the window invalidated around the slot
    window: usize,
    window_len: usize,

    /// Offset of the trampoline entrypoint (if we emitted one)
    entry: Option<usize>,

    /// Cleared on every write, set on every invalidation.
    coherent: bool,
}

impl TestPad {
    /// Map the arena at the configured address, emit the trampoline into it,
    /// and return a pad that can actually be executed.
    pub fn install(cfg: &HarnessConfig) -> Result<Self> {
        let mut arena = CodeArena::fixed(cfg.arena_addr, cfg.arena_size)?;
        let image = assemble_trampoline(
            arena.base_addr(), cfg.layout, cfg.counter_index
        )?;
        let window_len = pad_window_len(&image, cfg.layout);
        let needed = image.bytes.len().max(image.pad_fn + window_len);
        if needed > arena.len() {
            return Err(HarnessError::Assemble(format!(
                "image needs {:#x} bytes but the arena is {:#x}",
                needed, arena.len()
            )));
        }
        arena.write(0, &image.bytes);

        let mut res = Self {
            arena,
            layout: cfg.layout,
            slot: image.slot,
            window: image.pad_fn,
            window_len,
            entry: Some(image.entry),
            coherent: false,
        };
        res.invalidate();
        tracing::debug!(
            "emitted trampoline at {:016x} (slot at +{:#x})",
            res.arena.base_addr(), res.slot
        );
        Ok(res)
    }

    /// Create a pad that is never executed. The bytes are only ever read
    /// back (ie. by the model machine).
    pub fn detached(layout: PadLayout) -> Result<Self> {
        let window_len = window_len(0, CACHE_LINE, layout);
        let len = window_len.next_multiple_of(0x1000);
        let mut arena = CodeArena::anywhere(len)?;
        arena.fill(0, len, FAULT);
        let mut res = Self {
            arena,
            layout,
            slot: CACHE_LINE,
            window: 0,
            window_len,
            entry: None,
            coherent: false,
        };
        res.stage(&[], &[])?;
        Ok(res)
    }

    pub fn layout(&self) -> PadLayout { self.layout }

    /// Returns true if the slot has been invalidated since the last write.
    pub fn is_coherent(&self) -> bool { self.coherent }

    /// Return the current contents of the staging slot.
    pub fn slot_bytes(&self) -> &[u8] {
        self.arena.bytes(self.slot, self.layout.slot_len())
    }

    /// Offsets of the bytes flushed by [TestPad::invalidate].
    pub fn window(&self) -> std::ops::Range<usize> {
        self.window..self.window + self.window_len
    }

    /// Offsets of the staging slot.
    pub fn slot_range(&self) -> std::ops::Range<usize> {
        self.slot..self.slot + self.layout.slot_len()
    }

    /// Return the address of the staging slot.
    pub fn slot_addr(&self) -> usize {
        self.arena.base_addr() + self.slot
    }

    /// Write a candidate encoding and a tail into the slot, then invalidate.
    pub fn stage(&mut self, candidate: &[u8], tail: &[u8]) -> Result<()> {
        let PadLayout { padding_size, tail_size } = self.layout;
        if candidate.len() > padding_size {
            return Err(HarnessError::PadOverflow {
                len: candidate.len(), max: padding_size
            });
        }
        if tail.len() > tail_size {
            return Err(HarnessError::TailOverflow {
                len: tail.len(), max: tail_size
            });
        }

        self.coherent = false;

        self.arena.write(self.slot, candidate);
        self.arena.fill(self.slot + candidate.len(),
            padding_size - candidate.len(), FILLER
        );

        // Anything in the tail slot that isn't part of the tail must fault,
        // otherwise bytes from a previous (longer) tail would survive.
        let tail_off = self.slot + padding_size;
        self.arena.write(tail_off, tail);
        self.arena.fill(tail_off + tail.len(), tail_size - tail.len() + 1, FAULT);

        self.invalidate();
        Ok(())
    }

    /// Invalidate and flush the window around the slot (and the head of the
    /// trampoline), making the staged bytes visible to instruction fetch.
    pub fn invalidate(&mut self) {
        self.arena.flush(self.window, self.window_len);
        if let Some(entry) = self.entry {
            self.arena.flush(entry, TRAMPOLINE_WINDOW);
        }
        self.coherent = true;
    }

    /// Return a function pointer to the trampoline.
    pub fn entry_fn(&self) -> Result<MeasuredFn> {
        if !self.coherent {
            return Err(HarnessError::StalePad);
        }
        let entry = self.entry.ok_or(HarnessError::NoTrampoline)?;
        Ok(unsafe { self.arena.as_fn(entry) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stage_layout() {
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        pad.stage(&[0x0f, 0x1f, 0x00], &[0x0f, 0x5e, 0xe5]).unwrap();
        assert!(pad.is_coherent());

        let bytes = pad.slot_bytes();
        assert_eq!(bytes.len(), 19);
        assert_eq!(&bytes[..3], &[0x0f, 0x1f, 0x00]);
        assert!(bytes[3..15].iter().all(|b| *b == FILLER));
        assert_eq!(&bytes[15..18], &[0x0f, 0x5e, 0xe5]);
        assert_eq!(bytes[18], FAULT);
    }

    #[test]
    fn shorter_tail_clears_previous_tail() {
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        pad.stage(&[0x90], &[0x0f, 0x5e, 0xe5]).unwrap();
        pad.stage(&[0xce], &[]).unwrap();

        let bytes = pad.slot_bytes();
        assert_eq!(bytes[0], FAULT);
        assert!(bytes[1..15].iter().all(|b| *b == FILLER));
        assert!(bytes[15..].iter().all(|b| *b == FAULT));
    }

    #[test]
    fn oversized_input() {
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        match pad.stage(&[0x66; 16], &[]) {
            Err(HarnessError::PadOverflow { len: 16, max: 15 }) => {},
            other => panic!("unexpected {:?}", other.err()),
        }
        match pad.stage(&[0x90], &[0; 4]) {
            Err(HarnessError::TailOverflow { len: 4, max: 3 }) => {},
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn window_covers_large_slots() {
        for layout in [PadLayout::x86(), PadLayout::new(600, 3), PadLayout::new(15, 1000)] {
            let img = assemble_trampoline(0x1000_0000, layout, 0).unwrap();
            let len = pad_window_len(&img, layout);
            assert!(len >= PAD_WINDOW);
            assert!(img.slot + layout.slot_len() <= img.pad_fn + len,
                "{:?}", layout
            );

            let pad = TestPad::detached(layout).unwrap();
            let (window, slot) = (pad.window(), pad.slot_range());
            assert!(window.start <= slot.start && slot.end <= window.end);
        }
        let img = assemble_trampoline(0x1000_0000, PadLayout::x86(), 0).unwrap();
        assert_eq!(pad_window_len(&img, PadLayout::x86()), PAD_WINDOW);
    }

    #[test]
    fn stale_and_detached_pads_cannot_execute() {
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        pad.coherent = false;
        assert!(matches!(pad.entry_fn(), Err(HarnessError::StalePad)));
        pad.invalidate();
        assert!(matches!(pad.entry_fn(), Err(HarnessError::NoTrampoline)));
    }
}
