//! Reference measurements taken before scanning.
//!
//! Every candidate is judged against what the pad costs when it holds
//! nothing but filler and the fault. If those reference numbers don't hang
//! together, nothing measured afterwards can be trusted, so the run stops.

use std::fmt;

use serde::Serialize;

use crate::error::{ HarnessError, Result };
use crate::machine::Machine;
use crate::measure::{ Prober, UopCounts };
use crate::pad::{ FAULT, FILLER };

/// Staged alone, this fills the whole slot with filler.
pub const NOP_SEQUENCE: [u8; 1] = [FILLER];
pub const FAULT_SEQUENCE: [u8; 1] = [FAULT];
pub const NOP_FAULT_SEQUENCE: [u8; 2] = [FILLER, FAULT];

/// Returns true if `bytes` is one of the sequences used for calibration.
pub fn is_baseline_sequence(bytes: &[u8]) -> bool {
    bytes == NOP_SEQUENCE || bytes == FAULT_SEQUENCE || bytes == NOP_FAULT_SEQUENCE
}

/// Calibration progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationStage {
    MeasureNop,
    MeasureFault,
    MeasureNopFault,
    MeasureDivider,
    Validate,
    Proceed,
    Abort,
}

/// Reference costs of the empty pad.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    /// Slot filled with filler
    pub nop: UopCounts,
    /// Fault at the start of the slot
    pub fault: UopCounts,
    /// One filler byte, then the fault
    pub nop_fault: UopCounts,
    /// Divider activity when the tail is never reached
    pub divider: u32,
    /// Legacy-path uops for a single filler byte
    pub nop_uops: i64,
    pub padding_size: usize,
}

impl Baseline {
    /// Return every consistency check that this baseline fails.
    pub fn violations(&self) -> Vec<BaselineCheck> {
        let mut res = Vec::new();

        if self.nop_uops <= 0 {
            res.push(BaselineCheck::NopUopsNotPositive { nop_uops: self.nop_uops });
        }
        if self.nop_fault.ms() != self.fault.ms() {
            res.push(BaselineCheck::NopReachesMs {
                nop_fault: self.nop_fault.ms(), fault: self.fault.ms()
            });
        }
        for (sequence, counts) in [
            ("nop", &self.nop), ("fault", &self.fault), ("nop_fault", &self.nop_fault),
        ] {
            if counts.dsb() != 0 {
                res.push(BaselineCheck::DsbDelivered { sequence, uops: counts.dsb() });
            }
        }
        let expected = self.padding_size as i64 * self.nop_uops;
        let observed = self.nop.mite() as i64 - self.fault.mite() as i64;
        if expected != observed {
            res.push(BaselineCheck::NonLinearFiller { expected, observed });
        }
        res
    }

    /// Returns true if a candidate's decode counts can't be told apart from
    /// the fault alone.
    pub fn at_fault_baseline(&self, counts: &UopCounts) -> bool {
        counts.mite() <= self.fault.mite() && counts.ms() <= self.fault.ms()
    }

    /// Out-of-order cost of a raw divider measurement.
    pub fn out_of_order(&self, raw: u32) -> u32 {
        raw.saturating_sub(self.divider)
    }
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nop [{}], fault [{}], nop_fault [{}], divider {}, nop_uops {}",
            self.nop, self.fault, self.nop_fault, self.divider, self.nop_uops
        )
    }
}

/// A consistency check failed by a [Baseline].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BaselineCheck {
    /// A filler byte has to cost at least one legacy-path uop
    NopUopsNotPositive { nop_uops: i64 },
    /// The filler byte changed the microcode count
    NopReachesMs { nop_fault: u32, fault: u32 },
    /// The uop cache delivered something from a freshly invalidated pad
    DsbDelivered { sequence: &'static str, uops: u32 },
    /// Filling the slot didn't scale with the cost of one filler byte
    NonLinearFiller { expected: i64, observed: i64 },
}
impl fmt::Display for BaselineCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NopUopsNotPositive { nop_uops } =>
                write!(f, "nop_uops is {} (expected > 0)", nop_uops),
            Self::NopReachesMs { nop_fault, fault } =>
                write!(f, "nop_fault MS {} != fault MS {}", nop_fault, fault),
            Self::DsbDelivered { sequence, uops } =>
                write!(f, "{} delivered {} DSB uops", sequence, uops),
            Self::NonLinearFiller { expected, observed } =>
                write!(f, "nop MITE - fault MITE is {} (expected {})",
                    observed, expected),
        }
    }
}

/// Runs the calibration state machine.
pub struct Calibrator {
    stage: CalibrationStage,
    baseline: Baseline,
    violations: Vec<BaselineCheck>,
}

impl Calibrator {
    pub fn new(padding_size: usize) -> Self {
        Self {
            stage: CalibrationStage::MeasureNop,
            baseline: Baseline { padding_size, ..Default::default() },
            violations: Vec::new(),
        }
    }

    pub fn stage(&self) -> CalibrationStage { self.stage }

    /// Perform the work for the current stage and advance.
    pub fn step<M: Machine>(&mut self, prober: &mut Prober<M>)
        -> Result<CalibrationStage>
    {
        use CalibrationStage::*;
        self.stage = match self.stage {
            MeasureNop => {
                self.baseline.nop = prober.decode(&NOP_SEQUENCE)?;
                MeasureFault
            },
            MeasureFault => {
                self.baseline.fault = prober.decode(&FAULT_SEQUENCE)?;
                MeasureNopFault
            },
            MeasureNopFault => {
                self.baseline.nop_fault = prober.decode(&NOP_FAULT_SEQUENCE)?;
                self.baseline.nop_uops = self.baseline.nop_fault.mite() as i64
                    - self.baseline.fault.mite() as i64;
                MeasureDivider
            },
            MeasureDivider => {
                self.baseline.divider = prober.divider_activity(&FAULT_SEQUENCE)?;
                Validate
            },
            Validate => {
                self.violations = self.baseline.violations();
                if self.violations.is_empty() { Proceed } else { Abort }
            },
            done @ (Proceed | Abort) => done,
        };
        Ok(self.stage)
    }

    /// Run to completion.
    pub fn run<M: Machine>(mut self, prober: &mut Prober<M>) -> Result<Baseline> {
        loop {
            match self.step(prober)? {
                CalibrationStage::Proceed => {
                    tracing::info!("baseline: {}", self.baseline);
                    return Ok(self.baseline);
                },
                CalibrationStage::Abort => {
                    return Err(HarnessError::BaselineInconsistent {
                        baseline: Box::new(self.baseline),
                        violations: self.violations,
                    });
                },
                _ => {},
            }
        }
    }
}

/// Measure and validate the reference sequences.
pub fn calibrate<M: Machine>(prober: &mut Prober<M>) -> Result<Baseline> {
    let padding_size = prober.pad().layout().padding_size;
    Calibrator::new(padding_size).run(prober)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::{ ModelCore, ModelMachine };
    use crate::measure::SamplingConfig;
    use crate::pad::{ PadLayout, TestPad };

    fn prober(core: ModelCore) -> Prober<ModelMachine> {
        let pad = TestPad::detached(PadLayout::x86()).unwrap();
        Prober::new(ModelMachine::new(core), pad, SamplingConfig::default())
    }

    fn good() -> Baseline {
        Baseline {
            nop: UopCounts([16, 0, 4]),
            fault: UopCounts([1, 0, 4]),
            nop_fault: UopCounts([2, 0, 4]),
            divider: 1,
            nop_uops: 1,
            padding_size: 15,
        }
    }

    #[test]
    fn stages_in_order() {
        let mut p = prober(ModelCore::skylake());
        let mut c = Calibrator::new(15);
        let mut seen = vec![c.stage()];
        while !matches!(c.stage(), CalibrationStage::Proceed | CalibrationStage::Abort) {
            seen.push(c.step(&mut p).unwrap());
        }
        use CalibrationStage::*;
        assert_eq!(seen, vec![
            MeasureNop, MeasureFault, MeasureNopFault, MeasureDivider,
            Validate, Proceed,
        ]);
    }

    #[test]
    fn model_baseline() {
        let mut p = prober(ModelCore::skylake());
        let b = calibrate(&mut p).unwrap();
        assert_eq!(b, good());
    }

    #[test]
    fn every_violation_is_reported() {
        let b = Baseline {
            nop: UopCounts([16, 2, 4]),
            fault: UopCounts([1, 1, 4]),
            nop_fault: UopCounts([1, 0, 5]),
            nop_uops: 0,
            ..good()
        };
        let v = b.violations();
        assert_eq!(v, vec![
            BaselineCheck::NopUopsNotPositive { nop_uops: 0 },
            BaselineCheck::NopReachesMs { nop_fault: 5, fault: 4 },
            BaselineCheck::DsbDelivered { sequence: "nop", uops: 2 },
            BaselineCheck::DsbDelivered { sequence: "fault", uops: 1 },
            BaselineCheck::NonLinearFiller { expected: 0, observed: 15 },
        ]);
        assert!(good().violations().is_empty());
    }

    #[test]
    fn microcoded_filler_aborts() {
        let mut core = ModelCore::skylake();
        core.microcoded.push(iced_x86::Mnemonic::Nop);
        let mut p = prober(core);
        match calibrate(&mut p) {
            Err(HarnessError::BaselineInconsistent { violations, .. }) => {
                assert!(violations.contains(
                    &BaselineCheck::NopUopsNotPositive { nop_uops: 0 }
                ));
                assert!(violations.iter()
                    .any(|v| matches!(v, BaselineCheck::NopReachesMs { .. })));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(!p.machine().is_armed());
    }

    #[test]
    fn filtering_and_clamp() {
        let b = good();
        assert!(b.at_fault_baseline(&UopCounts([1, 0, 4])));
        assert!(b.at_fault_baseline(&UopCounts([0, 0, 0])));
        assert!(!b.at_fault_baseline(&UopCounts([2, 0, 4])));
        assert!(!b.at_fault_baseline(&UopCounts([1, 0, 8])));
        assert_eq!(b.out_of_order(0), 0);
        assert_eq!(b.out_of_order(6), 5);
    }
}
