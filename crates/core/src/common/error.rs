//! Simulator error definitions.
//!
//! This module defines the error type surfaced to the driver. It provides:
//! 1. **I/O and format errors:** Trace files that cannot be opened or parsed.
//! 2. **Lifecycle errors:** Trace exhaustion during warm-up and deadlock.
//! 3. **Std integration:** `Display` and `std::error::Error` implementations.

use std::fmt;
use std::io;

/// Errors reported by the simulator to its driver.
///
/// Queue overflow and other per-tick back-pressure conditions are not errors;
/// they are signalled by boolean returns and retried. This type covers the
/// conditions that end a run.
#[derive(Debug)]
pub enum SimError {
    /// A trace file could not be opened or read.
    Io(io::Error),

    /// A trace record was malformed (short read mid-record).
    TraceFormat(String),

    /// The trace ran out before the warm-up instruction count was reached.
    TraceExhausted { cpu: usize, read: u64, wanted: u64 },

    /// No component made progress for the deadlock window.
    Deadlock { cycle: u64 },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Io(e) => write!(f, "trace I/O error: {}", e),
            SimError::TraceFormat(msg) => write!(f, "malformed trace: {}", msg),
            SimError::TraceExhausted { cpu, read, wanted } => write!(
                f,
                "cpu {}: trace exhausted after {} instructions ({} required for warm-up)",
                cpu, read, wanted
            ),
            SimError::Deadlock { cycle } => {
                write!(f, "simulator deadlock detected at cycle {}", cycle)
            }
        }
    }
}

impl std::error::Error for SimError {}

impl From<io::Error> for SimError {
    fn from(e: io::Error) -> Self {
        SimError::Io(e)
    }
}
