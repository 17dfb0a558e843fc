//! Round-robin counters for replica selection and NPU core binding.

use std::sync::{Mutex, PoisonError};

use ml_core::NpuCore;

/// Picks the next slot out of `len`.
pub trait Rotation: Send + Sync {
    fn next_slot(&self, len: usize) -> usize;
}

/// Mutex-protected counter taken modulo the slot count.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: Mutex<u64>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            counter: Mutex::new(start),
        }
    }
}

impl Rotation for RoundRobin {
    fn next_slot(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (*counter % len as u64) as usize;
        *counter = counter.wrapping_add(1);
        slot
    }
}

/// Fixed table of NPU cores handed out in rotation, independent of how many
/// replicas exist.
pub struct CoreTable {
    cores: Vec<NpuCore>,
    rotation: Box<dyn Rotation>,
}

impl CoreTable {
    pub fn new() -> Self {
        Self::with_cores(NpuCore::ALL.to_vec())
    }

    pub fn with_cores(cores: Vec<NpuCore>) -> Self {
        Self {
            cores,
            rotation: Box::new(RoundRobin::new()),
        }
    }

    pub fn next(&self) -> NpuCore {
        match self.cores.get(self.rotation.next_slot(self.cores.len())) {
            Some(core) => *core,
            None => NpuCore::Core0,
        }
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}

impl Default for CoreTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn round_robin_cycles_from_zero() {
        let rr = RoundRobin::new();
        let slots: Vec<usize> = (0..7).map(|_| rr.next_slot(3)).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(rr.next_slot(0), 0);
    }

    #[test]
    fn round_robin_is_fair_across_threads() {
        let rr = Arc::new(RoundRobin::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rr = rr.clone();
                thread::spawn(move || (0..300).map(|_| rr.next_slot(3)).collect::<Vec<_>>())
            })
            .collect();
        let mut counts = [0usize; 3];
        for handle in handles {
            for slot in handle.join().unwrap() {
                counts[slot] += 1;
            }
        }
        assert_eq!(counts, [400, 400, 400]);
    }

    #[test]
    fn core_table_wraps_independently_of_replica_count() {
        let table = CoreTable::new();
        let cores: Vec<NpuCore> = (0..5).map(|_| table.next()).collect();
        assert_eq!(
            cores,
            vec![
                NpuCore::Core0,
                NpuCore::Core1,
                NpuCore::Core2,
                NpuCore::Core0,
                NpuCore::Core1
            ]
        );
    }
}
