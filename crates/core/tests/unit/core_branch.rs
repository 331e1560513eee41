//! Branch misprediction fetch-freeze test.

use tracesim_core::channel::{Channels, Response};
use tracesim_core::common::LOG2_BLOCK_SIZE;
use tracesim_core::config::CoreConfig;
use tracesim_core::core::OooCore;
use tracesim_core::core::instruction::{OooInstr, REG_FLAGS, REG_INSTRUCTION_POINTER};

/// Answers every L1I/L1D request on the next tick, so the pipeline is only
/// limited by its own structure.
fn instant_memory(channels: &mut Channels, bus: tracesim_core::channel::ChannelId) {
    let mut responses = Vec::new();
    while let Some(req) = channels[bus].rq.pop_front() {
        responses.push(Response::for_request(&req, 0));
    }
    while let Some(req) = channels[bus].wq.pop_front() {
        let _ = req;
    }
    channels[bus].returned.extend(responses);
}

fn nop(id: u64, ip: u64) -> OooInstr {
    OooInstr::new(id, ip, false, false, vec![1], vec![], vec![], vec![])
}

/// A conditional branch, taken in the trace.
fn taken_branch(id: u64, ip: u64, target: u64) -> OooInstr {
    let mut instr = OooInstr::new(
        id,
        ip,
        true,
        true,
        vec![REG_INSTRUCTION_POINTER],
        vec![REG_INSTRUCTION_POINTER, REG_FLAGS],
        vec![],
        vec![],
    );
    instr.branch_target = target;
    instr
}

#[test]
fn mispredicted_branch_freezes_fetch_until_penalty_after_retire() {
    let penalty = 10;
    let config = CoreConfig {
        mispredict_penalty: penalty,
        ..CoreConfig::default()
    };

    let mut channels = Channels::new();
    let l1i = channels.create(32, 32, 32, LOG2_BLOCK_SIZE, false);
    let l1d = channels.create(32, 32, 32, LOG2_BLOCK_SIZE, false);
    let mut core = OooCore::new(&config, 0, l1i, l1d);
    core.initialize();

    // A taken conditional branch (the cold predictor guesses not-taken),
    // followed by a stream the frozen fetch must hold back.
    core.input_queue.push_back(taken_branch(0, 0x41000, 0x42000));
    for i in 1..20 {
        core.input_queue.push_back(nop(i, 0x42000 + 4 * i));
    }

    let mut retire_cycle = None;
    let mut resume_cycle = None;
    let mut queued = core.input_queue.len();

    for cycle in 1..200u64 {
        instant_memory(&mut channels, l1i);
        instant_memory(&mut channels, l1d);
        core.operate(&mut channels);

        if retire_cycle.is_none() && core.num_retired >= 1 {
            retire_cycle = Some(cycle);
        }
        if core.input_queue.len() < queued {
            // Instructions entered the fetch buffer this cycle.
            if cycle > 1 {
                resume_cycle = Some(cycle);
                break;
            }
            queued = core.input_queue.len();
        }
    }

    let retired_at = retire_cycle.expect("the branch must retire");
    let resumed_at = resume_cycle.expect("fetch must eventually resume");

    // Only the branch itself entered before the freeze.
    assert_eq!(queued, 19);
    // No instruction entered the fetch buffer until the penalty elapsed
    // after retirement.
    assert_eq!(resumed_at, retired_at + penalty);
    assert_eq!(core.stats.branch_type_misses.iter().sum::<u64>(), 1);
}
