//! Turning a staged candidate into uop counts.

use serde::Serialize;

use crate::error::Result;
use crate::events::*;
use crate::machine::{ CounterSession, Machine };
use crate::pad::TestPad;
use crate::stats::{ RawResults, ResultList };

/// `divps xmm4, xmm5`: staged after the candidate when measuring
/// out-of-order execution.
pub const OOO_TAIL: [u8; 3] = [0x0f, 0x5e, 0xe5];

/// The front-end path that delivered a uop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodePath {
    /// Legacy decode pipeline
    Mite,
    /// Decoded stream buffer
    Dsb,
    /// Microcode sequencer
    Ms,
}
impl DecodePath {
    pub const ALL: [DecodePath; 3] = [Self::Mite, Self::Dsb, Self::Ms];

    pub fn event(&self) -> SkylakeEvent {
        match self {
            Self::Mite => SkylakeEvent::Idq(IdqMask::MiteUops),
            Self::Dsb => SkylakeEvent::Idq(IdqMask::DsbUops),
            Self::Ms => SkylakeEvent::Idq(IdqMask::MsUops),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Mite => 0,
            Self::Dsb => 1,
            Self::Ms => 2,
        }
    }
}

/// Uops delivered by each path, ordered `[MITE, DSB, MS]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UopCounts(pub [u32; 3]);
impl UopCounts {
    pub fn get(&self, path: DecodePath) -> u32 { self.0[path.index()] }
    pub fn mite(&self) -> u32 { self.get(DecodePath::Mite) }
    pub fn dsb(&self) -> u32 { self.get(DecodePath::Dsb) }
    pub fn ms(&self) -> u32 { self.get(DecodePath::Ms) }
}
impl std::fmt::Display for UopCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mite={} dsb={} ms={}", self.mite(), self.dsb(), self.ms())
    }
}

/// How many samples to take for each kind of measurement, and how hard to
/// try before giving up on one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Samples per MITE/MS measurement (reduced to the mode)
    pub decode_samples: usize,
    /// Samples per DSB measurement (the raw value is used)
    pub dsb_samples: usize,
    /// Samples per out-of-order measurement (reduced to the maximum)
    pub ooo_samples: usize,
    /// Attempts per sample before a measurement is declared unreliable.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}
impl SamplingConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;
}
impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            decode_samples: 64,
            dsb_samples: 1,
            ooo_samples: 8,
            max_attempts: Some(Self::DEFAULT_MAX_ATTEMPTS),
        }
    }
}

/// Stage `candidate` and `tail`, then fill `results` with clean samples of
/// `event`. The pad is invalidated before every sample.
///
/// Interrupts are masked and the counter is armed for the whole batch, and
/// released on every exit path.
pub fn run_test<M: Machine>(
    machine: &mut M,
    pad: &mut TestPad,
    candidate: &[u8],
    tail: &[u8],
    event: &EventDesc,
    results: &mut [u32],
    max_attempts: Option<u32>,
) -> Result<()>
{
    pad.stage(candidate, tail)?;
    let mut session = CounterSession::open(machine, event)?;
    for slot in results.iter_mut() {
        pad.invalidate();
        *slot = session.sample(pad, max_attempts)?;
    }
    Ok(())
}

/// Take a single clean sample of `event` with whatever is currently staged.
pub fn measure_once<M: Machine>(
    machine: &mut M,
    pad: &mut TestPad,
    event: &EventDesc,
    max_attempts: Option<u32>,
) -> Result<u32>
{
    let mut session = CounterSession::open(machine, event)?;
    pad.invalidate();
    session.sample(pad, max_attempts)
}

/// Owns a [Machine] and a [TestPad] and answers questions about a single
/// candidate.
pub struct Prober<M: Machine> {
    machine: M,
    pad: TestPad,
    cfg: SamplingConfig,
}
impl <M: Machine> Prober<M> {
    pub fn new(machine: M, pad: TestPad, cfg: SamplingConfig) -> Self {
        Self { machine, pad, cfg }
    }

    pub fn machine(&self) -> &M { &self.machine }
    pub fn machine_mut(&mut self) -> &mut M { &mut self.machine }
    pub fn pad(&self) -> &TestPad { &self.pad }
    pub fn sampling(&self) -> &SamplingConfig { &self.cfg }

    /// Collect `n` samples of `event` for a candidate.
    pub fn sample(&mut self, candidate: &[u8], tail: &[u8], event: &EventDesc,
        n: usize) -> Result<RawResults>
    {
        let mut results = vec![0u32; n];
        run_test(&mut self.machine, &mut self.pad, candidate, tail, event,
            &mut results, self.cfg.max_attempts
        )?;
        Ok(RawResults(results))
    }

    /// Number of uops delivered by one decode path.
    ///
    /// The DSB count is a single raw sample. MITE and MS counts are the mode
    /// over many samples.
    pub fn decode_path(&mut self, candidate: &[u8], path: DecodePath)
        -> Result<u32>
    {
        let event = path.event().as_desc();
        let n = match path {
            DecodePath::Dsb => self.cfg.dsb_samples,
            DecodePath::Mite | DecodePath::Ms => self.cfg.decode_samples,
        };
        let res = self.sample(candidate, &[], &event, n.max(1))?;
        let val = match path {
            DecodePath::Dsb => res.0[0],
            DecodePath::Mite | DecodePath::Ms => res.get_mode().unwrap_or(0),
        };
        tracing::trace!("{:02x?} {:?}: {}", candidate, path, val);
        Ok(val)
    }

    /// Uops delivered by every decode path.
    pub fn decode(&mut self, candidate: &[u8]) -> Result<UopCounts> {
        let mut res = UopCounts::default();
        for path in DecodePath::ALL {
            res.0[path.index()] = self.decode_path(candidate, path)?;
        }
        Ok(res)
    }

    /// Largest observed divider activity with [OOO_TAIL] staged after the
    /// candidate. This is the raw value; callers subtract a baseline.
    pub fn divider_activity(&mut self, candidate: &[u8]) -> Result<u32> {
        let event = SkylakeEvent::Arith(ArithMask::DividerActive).as_desc();
        let n = self.cfg.ooo_samples.max(1);
        let res = self.sample(candidate, &OOO_TAIL, &event, n)?;
        Ok(res.get_max().unwrap_or(0))
    }
}
