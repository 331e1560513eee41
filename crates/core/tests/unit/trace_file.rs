//! Trace decoding tests: plain and compressed files, branch-target
//! back-patching, and wrap-around.

use std::io::Write;

use tracesim_core::core::instruction::{BranchType, REG_FLAGS, REG_INSTRUCTION_POINTER};
use tracesim_core::trace::{RECORD_BYTES, TraceRecord};
use tracesim_core::TraceReader;

fn three_records() -> Vec<TraceRecord> {
    vec![
        TraceRecord {
            ip: 0x1000,
            destination_registers: [1, 0],
            source_registers: [2, 3, 0, 0],
            ..TraceRecord::default()
        },
        TraceRecord {
            ip: 0x1008,
            is_branch: true,
            branch_taken: true,
            destination_registers: [REG_INSTRUCTION_POINTER, 0],
            source_registers: [REG_INSTRUCTION_POINTER, REG_FLAGS, 0, 0],
            ..TraceRecord::default()
        },
        TraceRecord {
            ip: 0x2000,
            source_memory: [0xbeef_0000, 0, 0, 0],
            ..TraceRecord::default()
        },
    ]
}

#[test]
fn reader_decodes_and_backpatches_targets() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for record in three_records() {
        file.as_file_mut().write_all(&record.to_bytes()).unwrap();
    }

    let mut reader = TraceReader::open(file.path()).unwrap();
    let first = reader.next_instr().unwrap().unwrap();
    assert_eq!(first.instr_id, 0);
    assert_eq!(first.ip, 0x1000);
    assert_eq!(first.branch, BranchType::NotBranch);
    assert_eq!(first.source_registers, vec![2, 3]);

    let branch = reader.next_instr().unwrap().unwrap();
    assert_eq!(branch.branch, BranchType::Conditional);
    assert!(branch.branch_taken);
    // The taken branch's target is the next record's ip.
    assert_eq!(branch.branch_target, 0x2000);

    let load = reader.next_instr().unwrap().unwrap();
    assert_eq!(load.source_memory, vec![0xbeef_0000]);

    // The trace wraps by default.
    let wrapped = reader.next_instr().unwrap().unwrap();
    assert_eq!(wrapped.ip, 0x1000);
    assert_eq!(wrapped.instr_id, 3);
}

#[test]
fn reader_reports_end_of_trace_when_not_repeating() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for record in three_records() {
        file.as_file_mut().write_all(&record.to_bytes()).unwrap();
    }

    let mut reader = TraceReader::open(file.path()).unwrap();
    reader.set_repeat(false);
    for _ in 0..3 {
        assert!(reader.next_instr().unwrap().is_some());
    }
    assert!(reader.next_instr().unwrap().is_none());
    assert_eq!(reader.records_read, 3);
}

#[test]
fn reader_rejects_truncated_records() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let bytes = three_records()[0].to_bytes();
    file.as_file_mut().write_all(&bytes[..RECORD_BYTES - 3]).unwrap();

    let mut reader = TraceReader::open(file.path()).unwrap();
    assert!(reader.next_instr().is_err());
}

#[test]
fn reader_decompresses_xz_traces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.xz");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut encoder = xz2::write::XzEncoder::new(file, 6);
        for record in three_records() {
            encoder.write_all(&record.to_bytes()).unwrap();
        }
        encoder.finish().unwrap();
    }

    let mut reader = TraceReader::open(&path).unwrap();
    let first = reader.next_instr().unwrap().unwrap();
    assert_eq!(first.ip, 0x1000);
    let branch = reader.next_instr().unwrap().unwrap();
    assert_eq!(branch.branch_target, 0x2000);
}
