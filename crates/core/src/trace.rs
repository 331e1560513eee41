//! Trace file decoding.
//!
//! Traces are sequences of fixed-layout binary records, one per retired
//! instruction of the traced program. This module provides:
//! 1. **Record decode:** The 64-byte little-endian layout.
//! 2. **Compression:** Transparent `.xz` decompression, the format the
//!    reference traces ship in.
//! 3. **Target back-patch:** A taken branch's target is the next record's
//!    instruction pointer, so records are decoded one ahead.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use xz2::read::XzDecoder;

use crate::common::SimError;
use crate::core::instruction::OooInstr;

/// On-disk size of one trace record in bytes.
pub const RECORD_BYTES: usize = 64;

/// Register slots per record.
const NUM_DEST_REGS: usize = 2;
const NUM_SRC_REGS: usize = 4;
const NUM_DEST_MEM: usize = 2;
const NUM_SRC_MEM: usize = 4;

/// One decoded trace record.
///
/// Layout, little-endian: `ip: u64`, `is_branch: u8`, `branch_taken: u8`,
/// two destination registers, four source registers (one byte each), two
/// destination memory addresses, four source memory addresses (`u64` each).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceRecord {
    pub ip: u64,
    pub is_branch: bool,
    pub branch_taken: bool,
    pub destination_registers: [u8; NUM_DEST_REGS],
    pub source_registers: [u8; NUM_SRC_REGS],
    pub destination_memory: [u64; NUM_DEST_MEM],
    pub source_memory: [u64; NUM_SRC_MEM],
}

impl TraceRecord {
    /// Decodes one record from its on-disk bytes.
    pub fn from_bytes(raw: &[u8; RECORD_BYTES]) -> Self {
        let mut rec = TraceRecord {
            ip: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            is_branch: raw[8] != 0,
            branch_taken: raw[9] != 0,
            ..TraceRecord::default()
        };
        rec.destination_registers.copy_from_slice(&raw[10..12]);
        rec.source_registers.copy_from_slice(&raw[12..16]);
        for (i, slot) in rec.destination_memory.iter_mut().enumerate() {
            let at = 16 + i * 8;
            *slot = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
        }
        for (i, slot) in rec.source_memory.iter_mut().enumerate() {
            let at = 32 + i * 8;
            *slot = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
        }
        rec
    }

    /// Encodes the record back to its on-disk bytes.
    pub fn to_bytes(&self) -> [u8; RECORD_BYTES] {
        let mut raw = [0u8; RECORD_BYTES];
        raw[0..8].copy_from_slice(&self.ip.to_le_bytes());
        raw[8] = self.is_branch as u8;
        raw[9] = self.branch_taken as u8;
        raw[10..12].copy_from_slice(&self.destination_registers);
        raw[12..16].copy_from_slice(&self.source_registers);
        for (i, slot) in self.destination_memory.iter().enumerate() {
            let at = 16 + i * 8;
            raw[at..at + 8].copy_from_slice(&slot.to_le_bytes());
        }
        for (i, slot) in self.source_memory.iter().enumerate() {
            let at = 32 + i * 8;
            raw[at..at + 8].copy_from_slice(&slot.to_le_bytes());
        }
        raw
    }

    fn into_instr(self, instr_id: u64) -> OooInstr {
        let keep_regs = |regs: &[u8]| regs.iter().copied().filter(|&r| r != 0).collect::<Vec<_>>();
        let keep_mem = |mem: &[u64]| mem.iter().copied().filter(|&a| a != 0).collect::<Vec<_>>();
        OooInstr::new(
            instr_id,
            self.ip,
            self.is_branch,
            self.branch_taken,
            keep_regs(&self.destination_registers),
            keep_regs(&self.source_registers),
            keep_mem(&self.destination_memory),
            keep_mem(&self.source_memory),
        )
    }
}

/// Streams instructions out of one trace file.
///
/// The reader keeps one decoded record of lookahead so a taken branch's
/// target can be patched from the following instruction pointer. When the
/// file ends the trace restarts from the beginning, as the reference
/// simulator does for long simulations of short traces.
pub struct TraceReader {
    path: std::path::PathBuf,
    source: Box<dyn Read + Send>,
    pending: Option<TraceRecord>,
    next_instr_id: u64,
    repeat: bool,
    /// Records decoded so far, across restarts.
    pub records_read: u64,
}

fn open_source(path: &Path) -> Result<Box<dyn Read + Send>, SimError> {
    let file = File::open(path)?;
    let buffered = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "xz") {
        Ok(Box::new(XzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

impl TraceReader {
    /// Opens a trace file, decompressing `.xz` transparently.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let path = path.as_ref().to_path_buf();
        let source = open_source(&path)?;
        Ok(Self {
            path,
            source,
            pending: None,
            next_instr_id: 0,
            repeat: true,
            records_read: 0,
        })
    }

    /// Controls whether an exhausted trace restarts from the top (default) or
    /// reports end of trace.
    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    fn read_record(&mut self) -> Result<Option<TraceRecord>, SimError> {
        let mut raw = [0u8; RECORD_BYTES];
        let mut filled = 0;
        while filled < RECORD_BYTES {
            match self.source.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SimError::Io(e)),
            }
        }
        match filled {
            0 => Ok(None),
            n if n == RECORD_BYTES => {
                self.records_read += 1;
                Ok(Some(TraceRecord::from_bytes(&raw)))
            }
            n => Err(SimError::TraceFormat(format!(
                "{}: truncated record ({} of {} bytes)",
                self.path.display(),
                n,
                RECORD_BYTES
            ))),
        }
    }

    /// Produces the next instruction.
    ///
    /// At end of file the trace restarts from the top when repeating,
    /// otherwise `Ok(None)` marks end of trace.
    pub fn next_instr(&mut self) -> Result<Option<OooInstr>, SimError> {
        let current = match self.pending.take() {
            Some(rec) => rec,
            None => match self.read_record()? {
                Some(rec) => rec,
                None if self.repeat => {
                    self.source = open_source(&self.path)?;
                    self.read_record()?.ok_or_else(|| {
                        SimError::TraceFormat(format!("{}: empty trace", self.path.display()))
                    })?
                }
                None => return Ok(None),
            },
        };

        self.pending = self.read_record()?;
        if self.pending.is_none() && self.repeat {
            self.source = open_source(&self.path)?;
            self.pending = self.read_record()?;
        }

        let id = self.next_instr_id;
        self.next_instr_id += 1;
        let mut instr = current.into_instr(id);
        if instr.branch_taken {
            if let Some(next) = &self.pending {
                instr.branch_target = next.ip;
            }
        }
        Ok(Some(instr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_round_trip() {
        let rec = TraceRecord {
            ip: 0x0000_7fff_dead_0000,
            is_branch: true,
            branch_taken: true,
            destination_registers: [26, 0],
            source_registers: [25, 26, 0, 0],
            destination_memory: [0, 0],
            source_memory: [0x1000, 0, 0, 0],
        };
        let decoded = TraceRecord::from_bytes(&rec.to_bytes());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_record_is_64_bytes() {
        assert_eq!(RECORD_BYTES, 64);
    }
}
