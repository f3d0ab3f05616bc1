use core::fmt;

/// Half-open index range `[start, stop)` along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub stop: usize,
}

impl Span {
    pub fn new(start: usize, stop: usize) -> Self {
        debug_assert!(start <= stop, "span start {start} after stop {stop}");
        Self { start, stop }
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }

    /// Intersection of two spans; empty spans collapse onto the later start.
    pub fn intersect(&self, other: &Span) -> Span {
        let start = self.start.max(other.start);
        let stop = self.stop.min(other.stop).max(start);
        Span { start, stop }
    }

    /// Re-express this span relative to `origin`. Requires `origin <= start`.
    pub fn shifted_down(&self, origin: usize) -> Span {
        Span {
            start: self.start - origin,
            stop: self.stop - origin,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.stop)
    }
}

/// Rectangular sub-block: one [`Span`] per axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Region {
    spans: Vec<Span>,
}

impl Region {
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    /// The whole of a block with the given extents.
    pub fn full(dims: &[usize]) -> Self {
        Self {
            spans: dims.iter().map(|&d| Span::new(0, d)).collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.spans.len()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Per-axis lengths.
    pub fn extents(&self) -> Vec<usize> {
        self.spans.iter().map(Span::len).collect()
    }

    /// Starting corner.
    pub fn origin(&self) -> Vec<usize> {
        self.spans.iter().map(|s| s.start).collect()
    }

    pub fn volume(&self) -> usize {
        self.spans.iter().map(Span::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }

    /// Axis-wise intersection. Both regions must have the same rank.
    pub fn intersect(&self, other: &Region) -> Region {
        debug_assert_eq!(self.ndim(), other.ndim());
        Region {
            spans: self
                .spans
                .iter()
                .zip(&other.spans)
                .map(|(a, b)| a.intersect(b))
                .collect(),
        }
    }

    /// Whether the two regions share at least one element.
    pub fn overlaps(&self, other: &Region) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Whether `other` lies entirely inside this region.
    pub fn contains(&self, other: &Region) -> bool {
        self.ndim() == other.ndim()
            && self
                .spans
                .iter()
                .zip(&other.spans)
                .all(|(a, b)| a.start <= b.start && b.stop <= a.stop)
    }

    /// Re-express this region in the local frame of a block starting at
    /// `origin`.
    pub fn relative_to(&self, origin: &[usize]) -> Region {
        Region {
            spans: self
                .spans
                .iter()
                .zip(origin)
                .map(|(s, &o)| s.shifted_down(o))
                .collect(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{span}")?;
        }
        f.write_str("]")
    }
}
