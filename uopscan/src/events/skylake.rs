
use crate::events::*;

/// Unit masks for `IDQ` (event 0x79): uops delivered to the instruction
/// decode queue, split by the front-end path that produced them.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum IdqMask {
    /// Legacy decode pipeline
    MiteUops,
    /// Decoded stream buffer (uop cache)
    DsbUops,
    /// Microcode sequencer (either initiated by the MITE or the DSB)
    MsUops,
    Unk(u8),
}
impl IdqMask {
    pub fn desc(&self) -> MaskDesc {
        match self {
            Self::MiteUops => MaskDesc::new(0x04, "MITE_UOPS"),
            Self::DsbUops => MaskDesc::new(0x08, "DSB_UOPS"),
            Self::MsUops => MaskDesc::new(0x30, "MS_UOPS"),
            Self::Unk(x) => MaskDesc::new_unk(*x),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum ArithMask {
    /// Cycles when the divider is busy executing divide or square root
    DividerActive,
    Unk(u8),
}
impl ArithMask {
    pub fn desc(&self) -> MaskDesc {
        match self {
            Self::DividerActive => MaskDesc::new(0x01, "DIVIDER_ACTIVE"),
            Self::Unk(x) => MaskDesc::new_unk(*x),
        }
    }
}

/// Events on Skylake-derived cores used by the scanner.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum SkylakeEvent {
    Idq(IdqMask),
    Arith(ArithMask),
    Unk(u16, u8),
}
impl AsEventDesc for SkylakeEvent {
    fn as_desc(&self) -> EventDesc {
        match self {
            Self::Idq(m) => EventDesc::new(0x079, "IDQ", m.desc()),
            Self::Arith(m) => EventDesc::new(0x014, "ARITH", m.desc()),
            Self::Unk(id, mask) => {
                EventDesc::new_unk(*id, MaskDesc::new_unk(*mask))
            },
        }
    }
}
