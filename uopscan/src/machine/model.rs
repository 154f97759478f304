//! A deterministic software stand-in for a Skylake-like front-end.
//!
//! The model walks the staged slot with a decoder the same way the
//! speculative stream would: from the first byte, until the first fault, a
//! control transfer, or the end of the slot. Every decoded instruction is
//! charged to exactly one path:
//!
//! - Mnemonics in [ModelCore::microcoded] are charged to the MS.
//! - Everything else is charged to the MITE (one uop, plus one for a memory
//!   operand on anything that isn't a NOP/LEA).
//! - The pad is always freshly invalidated, so the DSB never delivers.
//!
//! The divider counts a small floor on every run, and `divider_cycles` more
//! when the walk reaches a `divps`.
//!
//! This is only good enough to exercise the harness (and for dry runs); it
//! makes no claim about real hardware beyond the invariants that the
//! baseline checks rely on.

use iced_x86::{ Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic };
use rand::rngs::StdRng;
use rand::{ Rng, SeedableRng };

use crate::error::{ HarnessError, Result };
use crate::events::*;
use crate::machine::Machine;
use crate::pad::{ TestPad, FAULT };

/// Parameters for the modelled core.
#[derive(Clone, Debug)]
pub struct ModelCore {
    /// MITE uops for the faulting byte
    pub fault_mite_uops: u32,
    /// MS uops for delivering the fault
    pub fault_ms_uops: u32,
    /// MS uops for each microcoded instruction
    pub microcode_uops: u32,
    /// Mnemonics which are delivered by the MS
    pub microcoded: Vec<Mnemonic>,
    /// Divider cycles observed on every run
    pub divider_floor: u32,
    /// Additional divider cycles when the walk reaches a `divps`
    pub divider_cycles: u32,
}
impl ModelCore {
    pub fn skylake() -> Self {
        Self {
            fault_mite_uops: 1,
            fault_ms_uops: 4,
            microcode_uops: 4,
            microcoded: vec![
                Mnemonic::Cpuid, Mnemonic::Rdtsc, Mnemonic::Rdtscp,
                Mnemonic::Xlatb, Mnemonic::Aaa, Mnemonic::Daa,
                Mnemonic::Enter, Mnemonic::Leave, Mnemonic::Cmpxchg8b,
                Mnemonic::Cmpxchg16b, Mnemonic::Fsin, Mnemonic::Fcos,
                Mnemonic::Fsincos, Mnemonic::Fptan, Mnemonic::Fpatan,
                Mnemonic::Pushf, Mnemonic::Pushfq, Mnemonic::Popf,
                Mnemonic::Popfq, Mnemonic::Std,
            ],
            divider_floor: 1,
            divider_cycles: 5,
        }
    }
}

/// How often the model reports contamination (ie. an SMI) during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Contamination {
    Never,
    /// Every n-th execution (1-indexed) is contaminated
    Every(u64),
    /// Every execution is contaminated
    Always,
}

/// Counters describing how the harness drove the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub mask_calls: u64,
    pub unmask_calls: u64,
    pub arms: u64,
    pub disarms: u64,
    pub executions: u64,
    pub contaminated: u64,
}

/// Result of walking the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Walk {
    mite: u32,
    ms: u32,
    reached_divider: bool,
}

struct Jitter {
    event: EventDesc,
    rng: StdRng,
    rate: f64,
    magnitude: u32,
}

pub struct ModelMachine {
    core: ModelCore,
    armed: Option<EventDesc>,
    masked: bool,
    smi_count: u64,
    contamination: Contamination,
    jitter: Option<Jitter>,
    stats: ModelStats,
}

impl ModelMachine {
    pub fn new(core: ModelCore) -> Self {
        Self {
            core,
            armed: None,
            masked: false,
            smi_count: 0,
            contamination: Contamination::Never,
            jitter: None,
            stats: ModelStats::default(),
        }
    }

    pub fn with_contamination(mut self, c: Contamination) -> Self {
        self.contamination = c;
        self
    }

    /// With probability `rate`, add between 1 and `magnitude` to samples of
    /// `event`. The noise is seeded, so runs are reproducible.
    pub fn with_jitter(mut self, event: EventDesc, seed: u64, rate: f64,
        magnitude: u32) -> Self
    {
        self.jitter = Some(Jitter {
            event, rng: StdRng::seed_from_u64(seed), rate, magnitude
        });
        self
    }

    pub fn core(&self) -> &ModelCore { &self.core }
    pub fn stats(&self) -> ModelStats { self.stats }
    pub fn is_armed(&self) -> bool { self.armed.is_some() }
    pub fn is_masked(&self) -> bool { self.masked }

    fn walk(&self, slot: &[u8]) -> Walk {
        let mut res = Walk::default();
        let mut decoder = Decoder::with_ip(64, slot, 0, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        loop {
            let pos = decoder.position();
            if pos >= slot.len() || slot[pos] == FAULT {
                break;
            }
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                break;
            }

            if self.core.microcoded.contains(&instr.mnemonic()) {
                res.ms += self.core.microcode_uops;
            } else {
                res.mite += Self::mite_uops(&instr);
            }
            if instr.mnemonic() == Mnemonic::Divps {
                res.reached_divider = true;
            }
            if instr.flow_control() != FlowControl::Next {
                return res;
            }
        }

        // The stream ends in a fault (explicit, undecodable, or truncated).
        res.mite += self.core.fault_mite_uops;
        res.ms += self.core.fault_ms_uops;
        res
    }

    fn mite_uops(instr: &Instruction) -> u32 {
        let has_mem = (0..instr.op_count())
            .any(|i| instr.op_kind(i) == iced_x86::OpKind::Memory);
        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Lea => 1,
            _ if has_mem => 2,
            _ => 1,
        }
    }

    fn count(&self, event: &EventDesc, walk: Walk) -> u32 {
        let idq = |m: IdqMask| SkylakeEvent::Idq(m).as_desc();
        let div = SkylakeEvent::Arith(ArithMask::DividerActive).as_desc();
        if *event == idq(IdqMask::MiteUops) {
            walk.mite
        } else if *event == idq(IdqMask::MsUops) {
            walk.ms
        } else if *event == div {
            self.core.divider_floor
                + if walk.reached_divider { self.core.divider_cycles } else { 0 }
        } else {
            0
        }
    }

    fn is_contaminated(&self) -> bool {
        match self.contamination {
            Contamination::Never => false,
            Contamination::Always => true,
            Contamination::Every(n) => n != 0 && self.stats.executions % n == 0,
        }
    }
}

impl Machine for ModelMachine {
    fn name(&self) -> &'static str { "model" }

    fn brand(&self) -> String { "uopscan model (skylake-like)".to_string() }

    fn mask_interrupts(&mut self) -> Result<()> {
        self.stats.mask_calls += 1;
        self.masked = true;
        Ok(())
    }

    fn unmask_interrupts(&mut self) {
        if self.masked {
            self.stats.unmask_calls += 1;
        }
        self.masked = false;
    }

    fn arm(&mut self, event: &EventDesc) -> Result<()> {
        self.stats.arms += 1;
        self.armed = Some(event.clone());
        Ok(())
    }

    fn disarm(&mut self) {
        if self.armed.take().is_some() {
            self.stats.disarms += 1;
        }
    }

    fn reset_counter(&mut self) -> Result<()> { Ok(()) }

    fn contamination_count(&mut self) -> Result<u64> { Ok(self.smi_count) }

    fn execute(&mut self, pad: &TestPad) -> Result<u32> {
        if !pad.is_coherent() {
            return Err(HarnessError::StalePad);
        }
        let event = self.armed.clone().ok_or_else(|| HarnessError::Counter {
            event: "<none>".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other,
                "no counter armed"),
        })?;

        self.stats.executions += 1;
        let mut delta = self.count(&event, self.walk(pad.slot_bytes()));

        if let Some(j) = self.jitter.as_mut() {
            if j.event == event && j.magnitude > 0 && j.rng.gen_bool(j.rate) {
                delta += j.rng.gen_range(1..=j.magnitude);
            }
        }

        if self.is_contaminated() {
            self.stats.contaminated += 1;
            self.smi_count += 1;
            delta = delta.wrapping_add(1000);
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pad::PadLayout;

    fn run(m: &mut ModelMachine, pad: &TestPad, ev: SkylakeEvent) -> u32 {
        m.arm(&ev.as_desc()).unwrap();
        let res = m.execute(pad).unwrap();
        m.disarm();
        res
    }

    #[test]
    fn fault_stops_the_walk() {
        let mut m = ModelMachine::new(ModelCore::skylake());
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        let mite = SkylakeEvent::Idq(IdqMask::MiteUops);
        let ms = SkylakeEvent::Idq(IdqMask::MsUops);

        pad.stage(&[0xce], &[]).unwrap();
        assert_eq!(run(&mut m, &pad, mite), 1);
        assert_eq!(run(&mut m, &pad, ms), 4);

        pad.stage(&[0x90], &[]).unwrap();
        assert_eq!(run(&mut m, &pad, mite), 16);
        assert_eq!(run(&mut m, &pad, ms), 4);
    }

    #[test]
    fn microcoded_instructions_go_to_ms() {
        let mut m = ModelMachine::new(ModelCore::skylake());
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        // cpuid
        pad.stage(&[0x0f, 0xa2], &[]).unwrap();
        assert_eq!(run(&mut m, &pad, SkylakeEvent::Idq(IdqMask::MsUops)), 8);
        assert_eq!(run(&mut m, &pad, SkylakeEvent::Idq(IdqMask::DsbUops)), 0);
    }

    #[test]
    fn divider_needs_the_tail() {
        let mut m = ModelMachine::new(ModelCore::skylake());
        let mut pad = TestPad::detached(PadLayout::x86()).unwrap();
        let div = SkylakeEvent::Arith(ArithMask::DividerActive);

        pad.stage(&[0xce], &[]).unwrap();
        assert_eq!(run(&mut m, &pad, div), 1);

        pad.stage(&[0x90], &[0x0f, 0x5e, 0xe5]).unwrap();
        assert_eq!(run(&mut m, &pad, div), 6);

        // A jump never falls through to the tail.
        pad.stage(&[0xeb, 0x00], &[0x0f, 0x5e, 0xe5]).unwrap();
        assert_eq!(run(&mut m, &pad, div), 1);
    }

    #[test]
    fn requires_armed_counter_and_coherent_pad() {
        let mut m = ModelMachine::new(ModelCore::skylake());
        let pad = TestPad::detached(PadLayout::x86()).unwrap();
        assert!(matches!(m.execute(&pad), Err(HarnessError::Counter { .. })));
    }

    #[test]
    fn contamination_every_n() {
        let mut m = ModelMachine::new(ModelCore::skylake())
            .with_contamination(Contamination::Every(3));
        let pad = TestPad::detached(PadLayout::x86()).unwrap();
        m.arm(&SkylakeEvent::Idq(IdqMask::MiteUops).as_desc()).unwrap();
        for _ in 0..9 {
            m.execute(&pad).unwrap();
        }
        assert_eq!(m.stats().contaminated, 3);
        assert_eq!(m.contamination_count().unwrap(), 3);
    }
}
