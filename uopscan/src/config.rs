//! Harness configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::measure::SamplingConfig;
use crate::pad::PadLayout;

/// The microarchitecture we're characterizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetPlatform {
    Skylake,
}

/// Where measurements come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Performance counters on the host CPU
    Hardware,
    /// The deterministic front-end model (no privileges required)
    Model,
}

/// Configuration for a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    /// The target platform
    pub platform: TargetPlatform,

    /// Optionally pin the caller to a specific hardware thread.
    pub pinned_core: Option<usize>,

    /// Fixed address of the code arena holding the trampoline and pad
    pub arena_addr: usize,
    pub arena_size: usize,

    /// Counter index passed to RDPMC
    pub counter_index: i32,

    /// Geometry of the staging slot
    pub layout: PadLayout,

    pub sampling: SamplingConfig,
}

impl HarnessConfig {
    /// Default base address for the code arena.
    const DEFAULT_ADDR: usize = 0x0000_1337_0000_0000;

    /// Default size of the code arena (one page is more than enough).
    const DEFAULT_SIZE: usize = 0x1000;

    pub fn default_skylake() -> Self {
        Self {
            platform: TargetPlatform::Skylake,
            pinned_core: Some(3),
            arena_addr: Self::DEFAULT_ADDR,
            arena_size: Self::DEFAULT_SIZE,
            counter_index: 0,
            layout: PadLayout::x86(),
            sampling: SamplingConfig::default(),
        }
    }

    pub fn from_cmdline_args(args: &ScanArgs) -> Self {
        let base = match args.platform {
            TargetPlatform::Skylake => Self::default_skylake(),
        };
        let max_attempts = if args.unbounded_retry {
            None
        } else {
            Some(args.max_attempts.unwrap_or(SamplingConfig::DEFAULT_MAX_ATTEMPTS))
        };
        let mut res = base
            .counter_index(args.counter)
            .max_attempts(max_attempts);
        if let Some(core) = args.core {
            res = res.pinned_core(Some(core));
        }
        res
    }
}

impl HarnessConfig {
    pub fn platform(mut self, x: TargetPlatform) -> Self {
        self.platform = x;
        self
    }
    pub fn pinned_core(mut self, x: Option<usize>) -> Self {
        self.pinned_core = x;
        self
    }
    pub fn arena(mut self, addr: usize, size: usize) -> Self {
        self.arena_addr = addr;
        self.arena_size = size;
        self
    }
    pub fn counter_index(mut self, x: i32) -> Self {
        self.counter_index = x;
        self
    }
    pub fn layout(mut self, x: PadLayout) -> Self {
        self.layout = x;
        self
    }
    pub fn decode_samples(mut self, x: usize) -> Self {
        self.sampling.decode_samples = x;
        self
    }
    pub fn dsb_samples(mut self, x: usize) -> Self {
        self.sampling.dsb_samples = x;
        self
    }
    pub fn ooo_samples(mut self, x: usize) -> Self {
        self.sampling.ooo_samples = x;
        self
    }
    pub fn max_attempts(mut self, x: Option<u32>) -> Self {
        self.sampling.max_attempts = x;
        self
    }
}

/// Command-line arguments for a scan.
#[derive(Parser, Debug)]
#[command(about = "Measure how the front-end delivers every x86 opcode")]
pub struct ScanArgs {
    /// Where measurements come from
    #[arg(long, value_enum, default_value_t = Backend::Hardware)]
    pub backend: Backend,

    /// Target microarchitecture
    #[arg(long, value_enum, default_value_t = TargetPlatform::Skylake)]
    pub platform: TargetPlatform,

    /// Core to pin to (overrides the platform default)
    #[arg(long)]
    pub core: Option<usize>,

    /// Counter index passed to RDPMC
    #[arg(long, default_value_t = 0)]
    pub counter: i32,

    /// Attempts per sample before a measurement is declared unreliable
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Retry contaminated samples forever
    #[arg(long, conflicts_with = "max_attempts")]
    pub unbounded_retry: bool,

    /// Only test the first N candidates
    #[arg(long)]
    pub limit: Option<usize>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cmdline_defaults() {
        let args = ScanArgs::parse_from(["uopscan"]);
        assert_eq!(args.backend, Backend::Hardware);
        let cfg = HarnessConfig::from_cmdline_args(&args);
        assert_eq!(cfg, HarnessConfig::default_skylake());
        assert_eq!(cfg.sampling.max_attempts,
            Some(SamplingConfig::DEFAULT_MAX_ATTEMPTS));
    }

    #[test]
    fn cmdline_overrides() {
        let args = ScanArgs::parse_from([
            "uopscan", "--backend", "model", "--core", "7", "--counter", "2",
            "--unbounded-retry", "--limit", "10",
        ]);
        assert_eq!(args.backend, Backend::Model);
        assert_eq!(args.limit, Some(10));
        let cfg = HarnessConfig::from_cmdline_args(&args);
        assert_eq!(cfg.pinned_core, Some(7));
        assert_eq!(cfg.counter_index, 2);
        assert_eq!(cfg.sampling.max_attempts, None);

        let args = ScanArgs::try_parse_from([
            "uopscan", "--unbounded-retry", "--max-attempts", "3",
        ]);
        assert!(args.is_err());
    }
}
