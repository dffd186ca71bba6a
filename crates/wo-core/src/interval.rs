//! Static interval index over half-open `[begin, end)` ranges.
//!
//! Built once per text from annotation postings and queried once per
//! sentence. Intervals are kept sorted by `(begin, end)`, so overlap queries
//! return them in ascending offset order.

/// An interval carrying a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval<T> {
    pub begin: usize,
    pub end: usize,
    pub data: T,
}

impl<T> Interval<T> {
    /// True when `[begin, end)` and `[start, stop)` share at least one position.
    pub fn overlaps(&self, start: usize, stop: usize) -> bool {
        self.begin < stop && start < self.end
    }
}

#[derive(Debug, Clone)]
pub struct IntervalIndex<T> {
    intervals: Vec<Interval<T>>,
}

impl<T> IntervalIndex<T> {
    /// Build an index, discarding empty or inverted intervals.
    pub fn new(intervals: impl IntoIterator<Item = Interval<T>>) -> Self {
        let mut intervals: Vec<Interval<T>> = intervals
            .into_iter()
            .filter(|iv| iv.begin < iv.end)
            .collect();
        intervals.sort_by_key(|iv| (iv.begin, iv.end));
        Self { intervals }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// All intervals overlapping `[start, stop)`, ascending by `(begin, end)`.
    pub fn overlapping(&self, start: usize, stop: usize) -> Vec<&Interval<T>> {
        // Everything at or after this position begins too late to overlap.
        let cutoff = self.intervals.partition_point(|iv| iv.begin < stop);
        self.intervals[..cutoff]
            .iter()
            .filter(|iv| iv.end > start)
            .collect()
    }
}
