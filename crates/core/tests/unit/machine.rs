//! Full-machine runs over synthetic traces.

use std::io::Write;

use tracesim_core::config::Config;
use tracesim_core::core::instruction::{REG_FLAGS, REG_INSTRUCTION_POINTER};
use tracesim_core::trace::TraceRecord;
use tracesim_core::{Machine, TraceReader};

/// Writes one loop iteration: strided loads, a store, some ALU work, and a
/// taken backward branch. The reader's wrap-around patches the branch
/// target back to the loop head.
fn write_loop_trace(file: &mut impl Write) {
    let base_ip = 0x40_0000u64;
    let data = 0x7f_0000u64;
    let mut records = Vec::new();

    for i in 0..12u64 {
        records.push(TraceRecord {
            ip: base_ip + 8 * i,
            destination_registers: [(i % 8 + 1) as u8, 0],
            source_registers: [(i % 8 + 2) as u8, 0, 0, 0],
            source_memory: [if i % 3 == 0 { data + 64 * i } else { 0 }, 0, 0, 0],
            destination_memory: [if i == 7 { data + 0x800 } else { 0 }, 0],
            ..TraceRecord::default()
        });
    }
    records.push(TraceRecord {
        ip: base_ip + 8 * 12,
        is_branch: true,
        branch_taken: true,
        destination_registers: [REG_INSTRUCTION_POINTER, 0],
        source_registers: [REG_INSTRUCTION_POINTER, REG_FLAGS, 0, 0],
        ..TraceRecord::default()
    });

    for record in &records {
        file.write_all(&record.to_bytes()).unwrap();
    }
}

#[test]
fn machine_runs_warmup_and_measured_phases() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_loop_trace(file.as_file_mut());

    let reader = TraceReader::open(file.path()).unwrap();
    let config = Config::default();
    let mut machine = Machine::new(&config, vec![reader]);

    let report = machine.run(200, 1000, 0).expect("simulation completes");

    let core = &report.cores[0];
    assert!(core.instrs() >= 1000, "measured {} instructions", core.instrs());
    assert!(core.cycles() > 0);

    // The fetch stream exercised the instruction cache.
    let l1i = report.caches.iter().find(|c| c.name.contains("L1I")).unwrap();
    let l1i_traffic: u64 = l1i.hits.iter().sum::<u64>() + l1i.misses.iter().sum::<u64>();
    assert!(l1i_traffic > 0);

    // The loop branch is taken every iteration; the predictor sees it.
    let branches: u64 = core.total_branch_types.iter().skip(1).sum();
    assert!(branches > 0);

    // Loads touched the data cache.
    let l1d = report.caches.iter().find(|c| c.name.contains("L1D")).unwrap();
    let l1d_traffic: u64 = l1d.hits.iter().sum::<u64>() + l1d.misses.iter().sum::<u64>();
    assert!(l1d_traffic > 0);
}

#[test]
fn report_serializes_to_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_loop_trace(file.as_file_mut());

    let reader = TraceReader::open(file.path()).unwrap();
    let mut machine = Machine::new(&Config::default(), vec![reader]);
    let report = machine.run(100, 200, 0).expect("simulation completes");

    let serialized = serde_json::to_value(&report).unwrap();
    assert!(serialized["cores"][0]["end_instrs"].as_u64().unwrap() > 0);
    assert!(serialized["caches"].as_array().unwrap().len() >= 7);
    assert!(serialized["dram_channels"].as_array().unwrap().len() >= 1);
}

#[test]
fn trace_exhausted_during_warmup_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..10u64 {
        let record = TraceRecord {
            ip: 0x40_0000 + 8 * i,
            destination_registers: [1, 0],
            ..TraceRecord::default()
        };
        file.as_file_mut().write_all(&record.to_bytes()).unwrap();
    }

    let mut reader = TraceReader::open(file.path()).unwrap();
    reader.set_repeat(false);
    let config = Config::default();
    let mut machine = Machine::new(&config, vec![reader]);

    let result = machine.run(1_000, 10, 0);
    assert!(matches!(
        result,
        Err(tracesim_core::common::SimError::TraceExhausted { .. })
    ));
}
