//! JSON output.
//!
//! A report is one object: a header describing the machine and its
//! baseline, and a `data` array with one [ResultEntry] per accepted
//! candidate. Scans are long, so [ReportWriter] streams entries out as they
//! are produced instead of building the whole document in memory.

use std::io::Write;

use serde::{ Deserialize, Serialize };

use crate::baseline::Baseline;
use crate::error::{ HarnessError, Result };

/// One accepted candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    /// Candidate bytes, truncated to the decoded length
    pub opcode: Vec<u8>,
    /// Intel-syntax rendering (empty if the candidate didn't decode)
    pub decoding: String,
    /// `[MITE, DSB, MS]`
    pub uops: [u32; 3],
    /// Divider cycles above the baseline
    pub out_of_order: u32,
    pub compat_mode: bool,
    pub valid: bool,
    pub dec_length: usize,
    pub iclass: String,
    pub category: String,
    pub extension: String,
    /// 0 for privileged instructions, otherwise 3
    pub cpl: u8,
}

/// Legacy-path and microcode uops for one baseline sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathBaseline {
    pub mits: u32,
    pub ms: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportHeader {
    pub brand: String,
    pub nop_baseline: PathBaseline,
    pub fault_baseline: PathBaseline,
    pub nop_uops: i64,
}
impl ReportHeader {
    pub fn new(brand: impl Into<String>, baseline: &Baseline) -> Self {
        Self {
            brand: brand.into(),
            nop_baseline: PathBaseline {
                mits: baseline.nop.mite(), ms: baseline.nop.ms()
            },
            fault_baseline: PathBaseline {
                mits: baseline.fault.mite(), ms: baseline.fault.ms()
            },
            nop_uops: baseline.nop_uops,
        }
    }
}

/// A complete report, as read back from disk.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Report {
    #[serde(flatten)]
    pub header: ReportHeader,
    pub data: Vec<ResultEntry>,
}

/// Writes a report one entry at a time.
pub struct ReportWriter<W: Write> {
    out: W,
    entries: usize,
}
impl <W: Write> ReportWriter<W> {
    /// Write the header and open the `data` array.
    pub fn begin(mut out: W, header: &ReportHeader) -> Result<Self> {
        let mut head = serde_json::to_vec(header)?;
        // Reopen the header object so that 'data' becomes its last member.
        match head.pop() {
            Some(b'}') => {},
            _ => return Err(HarnessError::Json(serde::ser::Error::custom(
                "report header is not a JSON object"
            ))),
        }
        out.write_all(&head)?;
        out.write_all(b",\"data\":[")?;
        Ok(Self { out, entries: 0 })
    }

    pub fn push(&mut self, entry: &ResultEntry) -> Result<()> {
        if self.entries != 0 {
            self.out.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.out, entry)?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> usize { self.entries }

    /// Close the document and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(b"]}\n")?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::measure::UopCounts;

    fn entry(opcode: &[u8]) -> ResultEntry {
        ResultEntry {
            opcode: opcode.to_vec(),
            decoding: "nop dword ptr [rax]".to_string(),
            uops: [2, 0, 4],
            out_of_order: 0,
            compat_mode: false,
            valid: true,
            dec_length: 3,
            iclass: "NOP".to_string(),
            category: "NOP".to_string(),
            extension: "BASE".to_string(),
            cpl: 3,
        }
    }

    fn header() -> ReportHeader {
        let baseline = Baseline {
            nop: UopCounts([16, 0, 4]),
            fault: UopCounts([1, 0, 4]),
            nop_fault: UopCounts([2, 0, 4]),
            divider: 1,
            nop_uops: 1,
            padding_size: 15,
        };
        ReportHeader::new("Test CPU", &baseline)
    }

    #[test]
    fn field_names() {
        let mut w = ReportWriter::begin(Vec::new(), &header()).unwrap();
        w.push(&entry(&[0x0f, 0x1f, 0x00])).unwrap();
        let bytes = w.finish().unwrap();

        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["brand"], "Test CPU");
        assert_eq!(v["nopBaseline"]["mits"], 16);
        assert_eq!(v["faultBaseline"]["ms"], 4);
        assert_eq!(v["nopUops"], 1);

        let e = &v["data"][0];
        assert_eq!(e["opcode"], serde_json::json!([0x0f, 0x1f, 0x00]));
        assert_eq!(e["uops"], serde_json::json!([2, 0, 4]));
        for key in ["decoding", "outOfOrder", "compatMode", "valid",
            "decLength", "iclass", "category", "extension", "cpl"]
        {
            assert!(e.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn empty_and_many() {
        let w = ReportWriter::begin(Vec::new(), &header()).unwrap();
        let bytes = w.finish().unwrap();
        let r: Report = serde_json::from_slice(&bytes).unwrap();
        assert!(r.data.is_empty());
        assert_eq!(r.header, header());

        let mut w = ReportWriter::begin(Vec::new(), &header()).unwrap();
        for op in 0..3u8 {
            w.push(&entry(&[op, 0x90])).unwrap();
        }
        assert_eq!(w.entries(), 3);
        let r: Report = serde_json::from_slice(&w.finish().unwrap()).unwrap();
        assert_eq!(r.data.len(), 3);
        assert_eq!(r.data[2].opcode, vec![2, 0x90]);
    }
}
