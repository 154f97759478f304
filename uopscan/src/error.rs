//! Errors produced by the harness.

use crate::baseline::{ Baseline, BaselineCheck };
use crate::events::EventDesc;

/// Everything that can go wrong while staging, measuring, or reporting.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("candidate is {len} bytes, but the pad only has room for {max}")]
    PadOverflow { len: usize, max: usize },

    #[error("tail is {len} bytes, but the pad only has room for {max}")]
    TailOverflow { len: usize, max: usize },

    /// The pad was written and then executed without being invalidated.
    #[error("test pad executed before its cache lines were invalidated")]
    StalePad,

    #[error("test pad has no trampoline attached")]
    NoTrampoline,

    #[error("failed to assemble trampoline: {0}")]
    Assemble(String),

    #[error("failed to map code arena at {addr:#018x} ({len:#x} bytes): {errno}")]
    Map { addr: usize, len: usize, errno: nix::errno::Errno },

    #[error("performance counter error for {event}: {source}")]
    Counter {
        event: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MSR {msr:#x} on cpu {cpu}: {errno}")]
    Msr { msr: u32, cpu: usize, errno: nix::errno::Errno },

    #[error("couldn't pin to cpu core {core}: {errno}")]
    Pin { core: usize, errno: nix::errno::Errno },

    #[error("couldn't change the signal mask: {0}")]
    SignalMask(nix::errno::Errno),

    /// Every attempt at a sample was contaminated.
    #[error("measurement of {} unreliable after {attempts} contaminated attempts", .event.name())]
    Unreliable { event: EventDesc, attempts: u32 },

    #[error("baseline inconsistent ({}): {baseline}",
        .violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    BaselineInconsistent {
        baseline: Box<Baseline>,
        violations: Vec<BaselineCheck>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
