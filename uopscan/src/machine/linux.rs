//! A [Machine] backed by the host CPU, through `perf_event_open()` and the
//! `msr` driver.
//!
//! Userspace can't execute `cli`, so "masking interrupts" here means
//! blocking every signal on the measuring thread. Hardware interrupts and
//! SMIs still happen: SMIs are caught with `MSR_SMI_COUNT`, and the
//! mode over many samples takes care of the rest.

use nix::sys::signal::{ pthread_sigmask, SigSet, SigmaskHow };
use perf_event::{ Builder, Counter };
use perf_event::events::Event;

use crate::config::HarnessConfig;
use crate::error::{ HarnessError, Result };
use crate::events::EventDesc;
use crate::machine::Machine;
use crate::pad::TestPad;
use crate::util::HostEnv;
use crate::util::msr::{ Msr, MSR_SMI_COUNT };

pub struct LinuxMachine {
    /// The core we're pinned to
    core: usize,

    /// Handle used to read the SMI count
    msr: Msr,

    /// Currently armed counter (if any)
    counter: Option<(EventDesc, Counter)>,

    /// Signal mask in effect before [Machine::mask_interrupts]
    saved_mask: Option<SigSet>,
}

impl LinuxMachine {
    /// Pin the current thread and open the MSR device for the pinned core.
    pub fn new(cfg: &HarnessConfig) -> Result<Self> {
        let core = cfg.pinned_core.unwrap_or(0);
        if cfg.pinned_core.is_some() {
            HostEnv::pin_to_core(core)?;
        } else {
            tracing::warn!("not pinned to a core; SMI counts are read from core 0");
        }

        match HostEnv::sysfs_rdpmc_enabled() {
            Ok(true) => {},
            Ok(false) => tracing::warn!("userspace RDPMC looks disabled; \
                expect SIGSEGV (try 'echo 2 > /sys/bus/event_source/devices/cpu/rdpmc')"),
            Err(e) => tracing::warn!("couldn't read the RDPMC setting: {}", e),
        }

        let msr = Msr::open(core)?;
        Ok(Self { core, msr, counter: None, saved_mask: None })
    }

    pub fn core(&self) -> usize { self.core }

    fn counter_mut(&mut self) -> Result<(&EventDesc, &mut Counter)> {
        match self.counter.as_mut() {
            Some((ev, ctr)) => Ok((&*ev, ctr)),
            None => Err(HarnessError::Counter {
                event: "<none>".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other,
                    "no counter armed"),
            }),
        }
    }
}

impl Machine for LinuxMachine {
    fn name(&self) -> &'static str { "hardware" }

    fn brand(&self) -> String { HostEnv::cpu_brand() }

    fn mask_interrupts(&mut self) -> Result<()> {
        let mut old = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut old))
            .map_err(HarnessError::SignalMask)?;
        if self.saved_mask.is_none() {
            self.saved_mask = Some(old);
        }
        Ok(())
    }

    fn unmask_interrupts(&mut self) {
        if let Some(old) = self.saved_mask.take() {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
                tracing::error!("couldn't restore the signal mask: {}", e);
            }
        }
    }

    fn arm(&mut self, event: &EventDesc) -> Result<()> {
        self.disarm();
        let wrap = |source| HarnessError::Counter {
            event: event.name().to_string(), source
        };
        let mut ctr = Builder::new()
            .kind(Event::Raw(event.perf_cfg_intel()))
            .include_kernel()
            .build()
            .map_err(wrap)?;
        ctr.enable().map_err(wrap)?;
        self.counter = Some((event.clone(), ctr));
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some((ev, mut ctr)) = self.counter.take() {
            if let Err(e) = ctr.disable() {
                tracing::warn!("couldn't disable counter for {}: {}", ev.name(), e);
            }
        }
    }

    fn reset_counter(&mut self) -> Result<()> {
        let (ev, ctr) = self.counter_mut()?;
        let name = ev.name().to_string();
        ctr.reset().map_err(|source| HarnessError::Counter { event: name, source })
    }

    fn contamination_count(&mut self) -> Result<u64> {
        self.msr.read(MSR_SMI_COUNT)
    }

    fn execute(&mut self, pad: &TestPad) -> Result<u32> {
        self.counter_mut()?;
        let func = pad.entry_fn()?;
        Ok(func(0, 0) as u32)
    }
}

impl Drop for LinuxMachine {
    fn drop(&mut self) {
        self.disarm();
        self.unmask_interrupts();
    }
}
