//! Measure how an x86 front-end delivers arbitrary byte sequences.
//!
//! Each candidate encoding is staged into a [TestPad] and executed
//! speculatively by a small trampoline, while a performance counter reports
//! how many uops came out of each decode path. See [Scanner] for the
//! overall flow.

pub mod asm;
pub mod baseline;
pub mod config;
pub mod decoder;
pub mod enumerate;
pub mod error;
pub mod events;
pub mod machine;
pub mod measure;
pub mod pad;
pub mod report;
pub mod scan;
pub mod stats;
pub mod trampoline;
pub mod util;

pub use crate::baseline::{ calibrate, Baseline, BaselineCheck, CalibrationStage };
pub use crate::config::{ Backend, HarnessConfig, ScanArgs, TargetPlatform };
pub use crate::decoder::{ IcedDecoder, StaticDecoder, StaticDecoding };
pub use crate::enumerate::{ candidates, Candidate };
pub use crate::error::{ HarnessError, Result };
pub use crate::events::*;
pub use crate::machine::*;
pub use crate::measure::*;
pub use crate::pad::{ PadLayout, TestPad };
pub use crate::report::{ Report, ReportHeader, ReportWriter, ResultEntry };
pub use crate::scan::{ Scan, ScanSummary, Scanner };
pub use crate::util::HostEnv;
