use crate::binary::BinaryModule;
use smallvec::SmallVec;

/// Snapshot of the stacktrace ring kept in link data.
///
/// The ring holds the last `capacity` wasm function indices entered and
/// not yet exited; `count` may exceed the capacity on deep stacks, in
/// which case only the innermost `capacity` entries survive.
#[derive(Debug, Clone)]
pub struct StacktraceSnapshot {
    entries: SmallVec<[u32; 8]>,
}

impl StacktraceSnapshot {
    /// Decode the ring: `idx` points one past the most recent entry;
    /// entries come out innermost first.
    pub fn from_ring(slots: &[u32], idx: u32, count: u32) -> Self {
        let capacity = slots.len() as u32;
        let mut entries = SmallVec::new();
        if capacity == 0 {
            return Self { entries };
        }
        let live = count.min(capacity);
        for k in 1..=live {
            entries.push(slots[((idx + capacity - k) % capacity) as usize]);
        }
        Self { entries }
    }

    /// Innermost first.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    pub fn iterate(&self, mut f: impl FnMut(u32)) {
        for entry in &self.entries {
            f(*entry);
        }
    }

    /// Log the trace with names resolved from the frozen module.
    pub fn print(&self, module: &BinaryModule) {
        if self.entries.is_empty() {
            tracing::info!("wasm stacktrace: <empty>");
            return;
        }
        for (depth, index) in self.entries.iter().enumerate() {
            match module.function_name(*index) {
                Some(name) => tracing::info!("  {depth:>3}: {name} (func {index})"),
                None => tracing::info!("  {depth:>3}: <wasm function {index}>"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_ring_reads_in_entry_order() {
        // Functions 7 then 9 entered, nothing exited: idx = 2, count = 2.
        let slots = [7, 9, 0, 0];
        let snap = StacktraceSnapshot::from_ring(&slots, 2, 2);
        assert_eq!(snap.entries(), &[9, 7]);
    }

    #[test]
    fn deep_ring_keeps_the_innermost() {
        // Ring of 3 after ten pushes: functions 8..10 survive, the next
        // write position wrapped to 1.
        let slots = [10, 8, 9];
        let snap = StacktraceSnapshot::from_ring(&slots, 1, 10);
        assert_eq!(snap.entries(), &[10, 9, 8]);
    }

    #[test]
    fn empty_ring() {
        let snap = StacktraceSnapshot::from_ring(&[0, 0], 0, 0);
        assert!(snap.entries().is_empty());
    }
}
