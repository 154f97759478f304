//! Scan every candidate encoding on a Skylake-derived core and write a JSON
//! report.
//!
//! Exits with status 2 if the baseline is inconsistent.

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use uopscan::*;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = ScanArgs::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<HarnessError>() {
            Some(HarnessError::BaselineInconsistent { baseline, violations }) => {
                tracing::error!("baseline inconsistent: {}", baseline);
                for v in violations {
                    tracing::error!("  {}", v);
                }
                tracing::error!("aborting without results");
                ExitCode::from(2)
            },
            _ => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            },
        },
    }
}

fn run(args: &ScanArgs) -> anyhow::Result<()> {
    let cfg = HarnessConfig::from_cmdline_args(args);
    tracing::debug!("{:?}", cfg);

    match args.backend {
        Backend::Hardware => {
            let machine = LinuxMachine::new(&cfg)
                .context("couldn't set up performance counters")?;
            let pad = TestPad::install(&cfg)
                .context("couldn't install the trampoline")?;
            scan(machine, pad, &cfg, args)
        },
        Backend::Model => {
            let machine = ModelMachine::new(ModelCore::skylake());
            let pad = TestPad::detached(cfg.layout)?;
            scan(machine, pad, &cfg, args)
        },
    }
}

fn scan<M: Machine>(machine: M, pad: TestPad, cfg: &HarnessConfig,
    args: &ScanArgs) -> anyhow::Result<()>
{
    tracing::info!("scanning with the {} backend", machine.name());
    let brand = machine.brand();
    let prober = Prober::new(machine, pad, cfg.sampling);
    let mut scanner = Scanner::calibrate(prober, IcedDecoder::new(cfg.layout))?;
    let header = ReportHeader::new(brand, scanner.baseline());

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("couldn't create {}", path.display()))?
        )),
        None => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
    };
    let writer = ReportWriter::begin(out, &header)?;

    let limit = args.limit.unwrap_or(usize::MAX);
    let summary = scanner.write_report(candidates().take(limit), writer)?;
    tracing::info!("tested {} candidates, accepted {}",
        summary.tested, summary.accepted
    );
    if summary.skipped != 0 {
        tracing::warn!("skipped {} unreliable candidates", summary.skipped);
    }
    Ok(())
}
