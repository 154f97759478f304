
pub mod skylake;

pub use skylake::*;

/// Implemented on some type representing an event for a particular platform.
pub trait AsEventDesc: Clone + Copy + PartialOrd + Ord + PartialEq + Eq {
    fn as_desc(&self) -> EventDesc;
}

/// Representation of an event mask.
pub struct MaskDesc {
    mask: u8,
    name: &'static str,
}
impl MaskDesc {
    pub const fn new(mask: u8, name: &'static str) -> Self {
        Self { mask, name }
    }
    pub const fn new_unk(mask: u8) -> Self {
        Self { mask, name: "Unk" }
    }
}

/// A performance event descriptor: the `(event_select, unit_mask)` pair
/// written into an event select MSR, along with a name used for logging.
///
/// Platform-specific events (see [SkylakeEvent]) are converted into this
/// type with [AsEventDesc] before they're handed to a [crate::Machine].
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct EventDesc {
    id: u16,
    mask: u8,
    name: String
}
impl EventDesc {
    pub fn new(id: u16, name: &str, mask: MaskDesc) -> Self {
        Self {
            id,
            mask: mask.mask,
            name: format!("{}.{}", name, mask.name),
        }
    }
    pub fn new_unk(id: u16, mask: MaskDesc) -> Self {
        Self {
            id,
            mask: mask.mask,
            name: format!("Event{:03x}:{:02x}", id, mask.mask),
        }
    }
    pub fn name(&self) -> &str { &self.name }

    pub fn id(&self) -> u16 { self.id }
    pub fn mask(&self) -> u8 { self.mask }

    /// Config bits for a raw 'perf' event (Intel event select layout).
    pub fn perf_cfg_intel(&self) -> u64 {
        let event_num = (self.id & 0xff) as u64;
        let mask_num = self.mask as u64;
        (mask_num << 8) | event_num
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intel_raw_config() {
        let desc = SkylakeEvent::Idq(IdqMask::MsUops).as_desc();
        assert_eq!(desc.perf_cfg_intel(), 0x3079);
        assert_eq!(desc.name(), "IDQ.MS_UOPS");

        let desc = EventDesc::new_unk(0x1cb, MaskDesc::new_unk(0x02));
        assert_eq!(desc.perf_cfg_intel(), 0x02cb);
        assert_eq!(desc.name(), "Event1cb:02");
    }
}
