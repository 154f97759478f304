//! Static metadata for a candidate encoding.
//!
//! This never affects what gets measured: it only annotates result
//! entries, and a candidate that doesn't decode is still recorded.

use iced_x86::{
    CpuidFeature, Decoder, DecoderOptions, Formatter, Instruction,
    IntelFormatter, Mnemonic,
};

use crate::pad::{ PadLayout, FILLER };

/// Metadata about one decoded instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticDecoding {
    /// Length of the decoded instruction in bytes
    pub length: usize,
    /// Intel-syntax rendering
    pub text: String,
    /// Instruction class (ie. `ADD`)
    pub iclass: String,
    /// Coarse category (ie. `NOP`, `CALL`, `NEXT`)
    pub category: String,
    /// ISA extension (ie. `BASE`, `SSE2`)
    pub extension: String,
    /// Exists on Skylake client parts
    pub valid: bool,
    /// Only executable at CPL 0
    pub ring0_only: bool,
    /// Only decodes outside of 64-bit mode
    pub compat_mode: bool,
}

pub trait StaticDecoder {
    /// Decode the first instruction in `bytes`.
    fn decode(&self, bytes: &[u8]) -> Option<StaticDecoding>;
}

/// Extensions that Skylake client parts don't implement.
const NOT_ON_SKYLAKE: &[&str] = &[
    "AVX512", "AMX", "AVX_VNNI", "AVX_IFMA", "AVX_NE_CONVERT", "AVX_VNNI_INT8",
    "SSE4A", "XOP", "FMA4", "TBM", "D3NOW", "SVM", "SKINIT", "CLZERO",
    "MONITORX", "RDPRU", "MCOMMIT", "SNP", "SEV", "INVLPGB", "PADLOCK",
    "CYRIX", "GEODE", "KNC", "SHA", "GFNI", "VAES", "VPCLMULQDQ", "CET",
    "ENQCMD", "MOVDIR", "WAITPKG", "SERIALIZE", "TSXLDTRK", "PCONFIG",
    "RDPID", "CLDEMOTE", "UINTR", "HRESET", "KL", "AESKLE", "WBNOINVD",
    "CLWB", "PKU", "TDX", "CMPCCXADD", "PREFETCHITI", "RAO_INT", "LKGS",
    "FRED", "MSRLIST", "WRMSRNS", "PTWRITE", "LWP", "PREFETCHWT1", "SGX2",
    "ENCLV", "AMD", "VIA", "AVX10", "APX", "USER_MSR", "MSR_IMM", "SM3",
    "SM4",
];

/// Returns true for features that make up the original ISA (the 8086
/// through the 486, and the 64-bit extensions).
fn is_base_feature(f: CpuidFeature) -> bool {
    let name = format!("{:?}", f);
    name.starts_with("INTEL") || name == "X64"
}

/// Static decoder backed by 'iced-x86'.
pub struct IcedDecoder {
    padding_size: usize,
}
impl IcedDecoder {
    pub fn new(layout: PadLayout) -> Self {
        Self { padding_size: layout.padding_size }
    }

    fn decode_with(bitness: u32, bytes: &[u8]) -> Option<Instruction> {
        let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() { None } else { Some(instr) }
    }

    fn extension(instr: &Instruction) -> String {
        match instr.cpuid_features().first() {
            None => "BASE".to_string(),
            Some(f) if is_base_feature(*f) => "BASE".to_string(),
            Some(f) => format!("{:?}", f),
        }
    }

    fn valid_on_skylake(instr: &Instruction) -> bool {
        instr.cpuid_features().iter().all(|f| {
            let name = format!("{:?}", f);
            !NOT_ON_SKYLAKE.iter().any(|x| name.starts_with(x))
        })
    }

    fn category(instr: &Instruction) -> String {
        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Fnop | Mnemonic::Reservednop => {
                "NOP".to_string()
            },
            _ => format!("{:?}", instr.flow_control()).to_uppercase(),
        }
    }
}

impl StaticDecoder for IcedDecoder {
    fn decode(&self, bytes: &[u8]) -> Option<StaticDecoding> {
        // Decode exactly what the pad would hold.
        let mut padded = bytes.to_vec();
        if padded.len() < self.padding_size {
            padded.resize(self.padding_size, FILLER);
        }

        let (instr, compat_mode) = match Self::decode_with(64, &padded) {
            Some(i) => (i, false),
            None => (Self::decode_with(32, &padded)?, true),
        };

        let mut text = String::new();
        IntelFormatter::new().format(&instr, &mut text);

        let op_code = instr.code().op_code();
        Some(StaticDecoding {
            length: instr.len(),
            text,
            iclass: format!("{:?}", instr.mnemonic()).to_uppercase(),
            category: Self::category(&instr),
            extension: Self::extension(&instr),
            valid: Self::valid_on_skylake(&instr),
            ring0_only: op_code.cpl0() && !op_code.cpl3(),
            compat_mode,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dec(bytes: &[u8]) -> Option<StaticDecoding> {
        IcedDecoder::new(PadLayout::x86()).decode(bytes)
    }

    #[test]
    fn single_byte_nop() {
        let d = dec(&[0x90]).unwrap();
        assert_eq!(d.length, 1);
        assert_eq!(d.iclass, "NOP");
        assert_eq!(d.category, "NOP");
        assert_eq!(d.extension, "BASE");
        assert!(d.valid);
        assert!(!d.ring0_only);
        assert!(!d.compat_mode);
    }

    #[test]
    fn multi_byte_nop_uses_filler() {
        // 0f 1f 80 <disp32> takes its displacement from the filler.
        let d = dec(&[0x0f, 0x1f, 0x80]).unwrap();
        assert_eq!(d.length, 7);
        assert_eq!(d.category, "NOP");
    }

    #[test]
    fn reserved_nop() {
        let d = dec(&[0x0f, 0x19, 0xc0]).unwrap();
        assert_eq!(d.category, "NOP");
        assert_eq!(d.length, 3);
    }

    #[test]
    fn missing_on_skylake() {
        // ptwrite eax
        let d = dec(&[0xf3, 0x0f, 0xae, 0xe0]).unwrap();
        assert_eq!(d.iclass, "PTWRITE");
        assert!(!d.valid);

        // cpuid and popcnt both exist
        assert!(dec(&[0x0f, 0xa2]).unwrap().valid);
        assert!(dec(&[0xf3, 0x0f, 0xb8, 0xc0]).unwrap().valid);
    }

    #[test]
    fn compat_fallback() {
        // 'push es' is gone in 64-bit mode.
        let d = dec(&[0x06]).unwrap();
        assert!(d.compat_mode);
        assert_eq!(d.length, 1);
        assert_eq!(d.iclass, "PUSH");
    }

    #[test]
    fn privileged_and_invalid() {
        let d = dec(&[0x0f, 0x01, 0xf8]).unwrap(); // swapgs
        assert!(d.ring0_only);

        let d = dec(&[0xf4]).unwrap(); // hlt
        assert!(d.ring0_only);

        let d = dec(&[0xc3]).unwrap();
        assert_eq!(d.category, "RETURN");

        // 'into' doesn't exist in 64-bit mode, but does in 32-bit mode
        let d = dec(&[0xce]).unwrap();
        assert!(d.compat_mode);

        // 0f 04 is unassigned in both modes
        assert!(dec(&[0x0f, 0x04]).is_none());
    }
}
