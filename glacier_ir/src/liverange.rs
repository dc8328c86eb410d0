//! Live ranges as ordered lists of disjoint half-open intervals.

/// Instruction number. Instructions are renumbered to even increasing
/// integers before liveness; odd numbers fall between instructions.
pub type InstNum = i32;

/// A live range: an ordered list of disjoint `[begin, end)` intervals of
/// instruction numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveRange {
    segments: Vec<(InstNum, InstNum)>,
}

impl LiveRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.segments.clear();
    }

    /// Add a segment, merging with the last one when they touch. Segments
    /// arrive in increasing order from liveness, except that a segment may
    /// extend the previous one.
    pub fn add_segment(&mut self, begin: InstNum, end: InstNum) {
        debug_assert!(begin <= end);
        if let Some(last) = self.segments.last_mut() {
            if begin <= last.1 {
                debug_assert!(begin >= last.0);
                last.1 = last.1.max(end);
                return;
            }
        }
        self.segments.push((begin, end));
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[(InstNum, InstNum)] {
        &self.segments
    }

    /// First instruction number of the range.
    pub fn start(&self) -> InstNum {
        debug_assert!(!self.is_empty());
        self.segments[0].0
    }

    /// One past the last instruction number of the range.
    pub fn end(&self) -> InstNum {
        debug_assert!(!self.is_empty());
        self.segments[self.segments.len() - 1].1
    }

    /// Whether the range ends before `other` begins.
    pub fn ends_before(&self, other: &LiveRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.end() <= other.start()
    }

    /// Interval intersection test. When `use_trimmed` is set, segments that
    /// end at or before `trim` are ignored, which lets the allocator skip
    /// the already-processed prefix of an inactive range.
    pub fn overlaps(&self, other: &LiveRange, use_trimmed: bool, trim: InstNum) -> bool {
        let mut i = 0usize;
        let mut j = 0usize;
        while i < self.segments.len() && j < other.segments.len() {
            let a = self.segments[i];
            let b = other.segments[j];
            if use_trimmed && a.1 <= trim {
                i += 1;
                continue;
            }
            if use_trimmed && b.1 <= trim {
                j += 1;
                continue;
            }
            if a.1 <= b.0 {
                i += 1;
            } else if b.1 <= a.0 {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Whether the range covers the single program point `num`.
    pub fn contains_value(&self, num: InstNum) -> bool {
        self.segments.iter().any(|&(b, e)| b <= num && num < e)
    }

    /// True when the two ranges share exactly the single point where one
    /// ends and the other begins. Such tail-defined / head-used pairs are
    /// treated as non-overlapping so the pair can share a register.
    pub fn overlaps_at_exactly_one_point(&self, other: &LiveRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (self.end() == other.start() + 1) || (other.end() == self.start() + 1)
    }
}

impl std::fmt::Display for LiveRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (b, e)) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "[{}:{})", b, e)?;
        }
        Ok(())
    }
}
