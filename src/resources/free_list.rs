use std::collections::{BTreeMap, BTreeSet};

/// Best-fit allocator handing out contiguous index ranges of a growable array.
///
/// Free runs are indexed twice: by `(length, start)` for best-fit lookups and by `start` for
/// coalescing with neighbours. Both indices always describe the same set of runs. The array
/// never shrinks: a run at its end stays free like any other.
#[derive(Debug, Default, Clone)]
pub struct FreeListAllocator {
    by_length: BTreeSet<(u32, u32)>,
    by_start: BTreeMap<u32, u32>,
    len: u32,
}

impl FreeListAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots the backing array must hold.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of free slots below `len()`.
    pub fn free_count(&self) -> u32 {
        self.by_start.values().sum()
    }

    /// Free runs as `(start, count)`, ordered by start.
    pub fn free_runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_start.iter().map(|(&start, &count)| (start, count))
    }

    /// Returns the first index of `count` contiguous slots.
    ///
    /// Takes the tail of the smallest free run that fits; the head stays free under its original start.
    /// Grows the array when no run fits.
    pub fn allocate(&mut self, count: u32) -> u32 {
        debug_assert!(count > 0);
        let fit = self.by_length.range((count, 0)..).next().copied();
        match fit {
            Some((length, start)) => {
                self.by_length.remove(&(length, start));
                let remnant = length - count;
                if remnant > 0 {
                    self.by_length.insert((remnant, start));
                    self.by_start.insert(start, remnant);
                } else {
                    self.by_start.remove(&start);
                }
                start + remnant
            }
            None => {
                let start = self.len;
                self.len += count;
                start
            }
        }
    }

    pub fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        debug_assert!(start + count <= self.len, "freeing past the end");
        let mut run_start = start;
        let mut run_count = count;

        if let Some((&prev_start, &prev_count)) = self.by_start.range(..start).next_back() {
            debug_assert!(prev_start + prev_count <= start, "range freed twice");
            if prev_start + prev_count == start {
                self.remove_run(prev_start, prev_count);
                run_start = prev_start;
                run_count += prev_count;
            }
        }
        if let Some((&next_start, &next_count)) = self.by_start.range(start..).next() {
            debug_assert!(start + count <= next_start, "range freed twice");
            if start + count == next_start {
                self.remove_run(next_start, next_count);
                run_count += next_count;
            }
        }

        self.by_length.insert((run_count, run_start));
        self.by_start.insert(run_start, run_count);
    }

    fn remove_run(&mut self, start: u32, count: u32) {
        self.by_start.remove(&start);
        self.by_length.remove(&(count, start));
    }

    /// Panics if the two indices disagree or a run is left unmerged.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.by_start.len(), self.by_length.len());
        for &(count, start) in &self.by_length {
            assert_eq!(self.by_start.get(&start), Some(&count));
        }
        let mut end = None;
        for (start, count) in self.free_runs() {
            assert!(count > 0);
            if let Some(end) = end {
                assert!(start > end, "adjacent free runs at {}", start);
            }
            end = Some(start + count);
        }
        if let Some(end) = end {
            assert!(end <= self.len);
        }
    }
}
