//! The machine that actually executes a staged pad.
//!
//! A [Machine] owns one programmable counter and the knobs needed to keep
//! it quiet while we measure. [CounterSession] scopes the knobs: opening a
//! session masks interrupts and arms the counter, and dropping it undoes
//! both on every exit path.

pub mod linux;
pub mod model;

pub use linux::LinuxMachine;
pub use model::{ ModelCore, ModelMachine, ModelStats, Contamination };

use crate::error::{ HarnessError, Result };
use crate::events::EventDesc;
use crate::pad::TestPad;

/// Interface to hardware (or a stand-in) capable of running a [TestPad] and
/// reporting a counter delta.
pub trait Machine {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Processor brand string.
    fn brand(&self) -> String;

    /// Keep asynchronous events off the measuring thread.
    fn mask_interrupts(&mut self) -> Result<()>;

    /// Undo [Machine::mask_interrupts]. Must be harmless when nothing is
    /// masked.
    fn unmask_interrupts(&mut self);

    /// Program and enable the counter for `event`.
    fn arm(&mut self, event: &EventDesc) -> Result<()>;

    /// Disable the counter. Must be harmless when nothing is armed.
    fn disarm(&mut self);

    /// Zero the counter.
    fn reset_counter(&mut self) -> Result<()>;

    /// Number of contaminating events (ie. SMIs) observed so far. Only the
    /// difference between two reads is meaningful.
    fn contamination_count(&mut self) -> Result<u64>;

    /// Run the trampoline once and return the counter delta it observed.
    fn execute(&mut self, pad: &TestPad) -> Result<u32>;
}

/// An armed counter with interrupts masked.
pub struct CounterSession<'m, M: Machine> {
    machine: &'m mut M,
    event: EventDesc,
}
impl <'m, M: Machine> CounterSession<'m, M> {
    pub fn open(machine: &'m mut M, event: &EventDesc) -> Result<Self> {
        machine.mask_interrupts()?;
        if let Err(e) = machine.arm(event) {
            machine.unmask_interrupts();
            return Err(e);
        }
        Ok(Self { machine, event: event.clone() })
    }

    pub fn event(&self) -> &EventDesc { &self.event }

    /// Take one sample, discarding any attempt that overlapped with a
    /// contaminating event.
    ///
    /// With `max_attempts == None`, this retries until a clean sample is
    /// observed.
    pub fn sample(&mut self, pad: &TestPad, max_attempts: Option<u32>)
        -> Result<u32>
    {
        let mut attempts = 0u32;
        loop {
            if let Some(limit) = max_attempts {
                if attempts >= limit {
                    return Err(HarnessError::Unreliable {
                        event: self.event.clone(), attempts
                    });
                }
            }
            attempts = attempts.saturating_add(1);

            self.machine.reset_counter()?;
            let before = self.machine.contamination_count()?;
            let delta = self.machine.execute(pad)?;
            let after = self.machine.contamination_count()?;
            if before == after {
                return Ok(delta);
            }
            tracing::trace!("{}: discarded contaminated sample ({} SMIs, attempt {})",
                self.event.name(), after.wrapping_sub(before), attempts
            );
        }
    }
}
impl <'m, M: Machine> Drop for CounterSession<'m, M> {
    fn drop(&mut self) {
        self.machine.disarm();
        self.machine.unmask_interrupts();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::*;
    use crate::pad::PadLayout;

    #[test]
    fn session_releases_on_drop() {
        let mut m = ModelMachine::new(ModelCore::skylake());
        let pad = TestPad::detached(PadLayout::x86()).unwrap();
        let ev = SkylakeEvent::Idq(IdqMask::MiteUops).as_desc();
        {
            let mut s = CounterSession::open(&mut m, &ev).unwrap();
            s.sample(&pad, Some(1)).unwrap();
        }
        assert!(!m.is_armed());
        assert!(!m.is_masked());
        assert_eq!(m.stats().mask_calls, m.stats().unmask_calls);
    }

    #[test]
    fn session_releases_on_error() {
        let mut m = ModelMachine::new(ModelCore::skylake())
            .with_contamination(Contamination::Always);
        let pad = TestPad::detached(PadLayout::x86()).unwrap();
        let ev = SkylakeEvent::Idq(IdqMask::MiteUops).as_desc();
        let res = CounterSession::open(&mut m, &ev)
            .and_then(|mut s| s.sample(&pad, Some(5)));
        match res {
            Err(HarnessError::Unreliable { attempts: 5, .. }) => {},
            other => panic!("unexpected {:?}", other),
        }
        assert!(!m.is_armed());
        assert!(!m.is_masked());
        assert_eq!(m.stats().executions, 5);
    }
}
