//! The scan driver: measure candidates, drop the ones that look like the
//! fault baseline, and annotate the rest.

use std::io::Write;

use crate::baseline::{ calibrate, is_baseline_sequence, Baseline };
use crate::decoder::StaticDecoder;
use crate::enumerate::Candidate;
use crate::error::{ HarnessError, Result };
use crate::machine::Machine;
use crate::measure::Prober;
use crate::report::{ ReportWriter, ResultEntry };

/// Log progress after this many candidates.
const PROGRESS_INTERVAL: usize = 0x1000;

pub struct Scanner<M: Machine, D: StaticDecoder> {
    prober: Prober<M>,
    decoder: D,
    baseline: Baseline,
}

impl <M: Machine, D: StaticDecoder> Scanner<M, D> {
    /// Calibrate against `prober`. Fails if the baseline is inconsistent.
    pub fn calibrate(mut prober: Prober<M>, decoder: D) -> Result<Self> {
        let baseline = calibrate(&mut prober)?;
        Ok(Self { prober, decoder, baseline })
    }

    pub fn baseline(&self) -> &Baseline { &self.baseline }
    pub fn prober(&self) -> &Prober<M> { &self.prober }

    /// Measure a single candidate.
    ///
    /// Returns `None` for baseline sequences, and for candidates whose
    /// decode counts are at or below the fault baseline.
    pub fn evaluate(&mut self, candidate: &[u8]) -> Result<Option<ResultEntry>> {
        if is_baseline_sequence(candidate) {
            return Ok(None);
        }

        let decoding = self.decoder.decode(candidate);
        let uops = self.prober.decode(candidate)?;
        if self.baseline.at_fault_baseline(&uops) {
            return Ok(None);
        }
        let raw = self.prober.divider_activity(candidate)?;
        let out_of_order = self.baseline.out_of_order(raw);

        let decoding = decoding.unwrap_or_default();
        let opcode = match decoding.length {
            0 => candidate.to_vec(),
            n => candidate[..n.min(candidate.len())].to_vec(),
        };
        let entry = ResultEntry {
            opcode,
            decoding: decoding.text,
            uops: uops.0,
            out_of_order,
            compat_mode: decoding.compat_mode,
            valid: decoding.valid,
            dec_length: decoding.length,
            iclass: decoding.iclass,
            category: decoding.category,
            extension: decoding.extension,
            cpl: if decoding.ring0_only { 0 } else { 3 },
        };
        tracing::debug!("{:02x?}: {:?} ooo={} '{}'",
            entry.opcode, entry.uops, entry.out_of_order, entry.decoding
        );
        Ok(Some(entry))
    }

    /// Lazily evaluate `candidates`, yielding accepted entries.
    pub fn scan<I>(&mut self, candidates: I) -> Scan<'_, M, D, I::IntoIter>
        where I: IntoIterator<Item = Candidate>
    {
        Scan {
            scanner: self,
            candidates: candidates.into_iter(),
            tested: 0,
            accepted: 0,
            skipped: 0,
        }
    }

    /// Scan `candidates` into `writer`, then close the report.
    ///
    /// The report is closed even when the scan stops early, so the entries
    /// written before the error still parse.
    pub fn write_report<I, W>(&mut self, candidates: I, mut writer: ReportWriter<W>)
        -> Result<ScanSummary>
        where I: IntoIterator<Item = Candidate>, W: Write
    {
        let mut scan = self.scan(candidates);
        let mut failure = None;
        for entry in scan.by_ref() {
            if let Err(e) = entry.and_then(|e| writer.push(&e)) {
                failure = Some(e);
                break;
            }
        }
        let summary = scan.summary();

        let closed = writer.finish();
        match (failure, closed) {
            (None, closed) => closed.map(|_| summary),
            (Some(e), Ok(_)) => Err(e),
            (Some(e), Err(close)) => {
                tracing::error!("couldn't close the report: {}", close);
                Err(e)
            },
        }
    }
}

/// Candidate totals for a scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub tested: usize,
    pub accepted: usize,
    /// Candidates dropped because no clean sample could be taken
    pub skipped: usize,
}

/// Iterator returned by [Scanner::scan]. Consumed candidates are gone: the
/// sequence can't be restarted.
///
/// A candidate that keeps getting contaminated is logged and skipped. Any
/// other error is yielded.
pub struct Scan<'s, M: Machine, D: StaticDecoder, I: Iterator<Item = Candidate>> {
    scanner: &'s mut Scanner<M, D>,
    candidates: I,
    tested: usize,
    accepted: usize,
    skipped: usize,
}

impl <'s, M, D, I> Scan<'s, M, D, I>
    where M: Machine, D: StaticDecoder, I: Iterator<Item = Candidate>
{
    pub fn tested(&self) -> usize { self.tested }
    pub fn accepted(&self) -> usize { self.accepted }
    pub fn skipped(&self) -> usize { self.skipped }

    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            tested: self.tested, accepted: self.accepted, skipped: self.skipped
        }
    }
}

impl <'s, M, D, I> Iterator for Scan<'s, M, D, I>
    where M: Machine, D: StaticDecoder, I: Iterator<Item = Candidate>
{
    type Item = Result<ResultEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let candidate = self.candidates.next()?;
            self.tested += 1;
            if self.tested % PROGRESS_INTERVAL == 0 {
                tracing::info!("tested {} candidates, accepted {}",
                    self.tested, self.accepted
                );
            }
            match self.scanner.evaluate(candidate.as_bytes()) {
                Ok(Some(entry)) => {
                    self.accepted += 1;
                    return Some(Ok(entry));
                },
                Ok(None) => continue,
                Err(e @ HarnessError::Unreliable { .. }) => {
                    self.skipped += 1;
                    tracing::warn!("skipping {:02x?}: {}", candidate.as_bytes(), e);
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
