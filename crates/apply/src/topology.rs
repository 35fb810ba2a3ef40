//! Guest vCPU count to sockets/cores/threads.

use vmshape_core::preference::{PreferredCpuTopology, SpreadAcross};
use vmshape_core::vm::Cpu;
use vmshape_core::PreferenceSpec;

/// Threads per core used when spreading across all three dimensions.
const SPREAD_THREADS: u32 = 2;

pub fn preferred_topology(pref: Option<&PreferenceSpec>) -> PreferredCpuTopology {
    pref.map(PreferenceSpec::preferred_topology).unwrap_or_default()
}

pub fn spread_options(pref: Option<&PreferenceSpec>) -> (u32, SpreadAcross) {
    pref.map(PreferenceSpec::spread_options).unwrap_or((vmshape_core::preference::DEFAULT_SPREAD_RATIO, SpreadAcross::default()))
}

pub(crate) fn apply(guest: u32, pref: Option<&PreferenceSpec>, cpu: &mut Cpu) {
    match preferred_topology(pref) {
        PreferredCpuTopology::Cores => cpu.cores = guest,
        PreferredCpuTopology::Threads => cpu.threads = guest,
        PreferredCpuTopology::Spread => {
            let (ratio, across) = spread_options(pref);
            match across {
                SpreadAcross::SocketsCores => {
                    cpu.sockets = guest / ratio;
                    cpu.cores = ratio;
                }
                SpreadAcross::CoresThreads => {
                    cpu.cores = guest / ratio;
                    cpu.threads = ratio;
                }
                SpreadAcross::SocketsCoresThreads => {
                    cpu.sockets = guest / SPREAD_THREADS / ratio;
                    cpu.cores = ratio;
                    cpu.threads = SPREAD_THREADS;
                }
            }
        }
        PreferredCpuTopology::Sockets | PreferredCpuTopology::Any => cpu.sockets = guest,
    }
    for dim in [&mut cpu.sockets, &mut cpu.cores, &mut cpu.threads] {
        if *dim == 0 {
            *dim = 1;
        }
    }
}
