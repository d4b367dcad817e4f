use crate::error::CacheError;

/// `[start, end]`, inclusive, with `end` optionally unbounded — spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl IntRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// The whole resource, from byte zero.
    pub fn full() -> Self {
        Self { start: 0, end: None }
    }

    /// `0 ≤ start`, `end ≥ start`, `end < source_length` when known.
    pub fn validate(&self, source_length: Option<u64>) -> Result<(), CacheError> {
        if let Some(end) = self.end {
            if end < self.start {
                return Err(CacheError::InvalidRange);
            }
        }
        if let Some(len) = source_length {
            if self.start >= len {
                return Err(CacheError::InvalidRange);
            }
            if let Some(end) = self.end {
                if end >= len {
                    return Err(CacheError::InvalidRange);
                }
            }
        }
        Ok(())
    }

    /// Exclusive end, resolved against a known source length when the
    /// range itself is open-ended.
    pub fn end_exclusive(&self, source_length: Option<u64>) -> Option<u64> {
        match (self.end, source_length) {
            (Some(end), _) => Some(end + 1),
            (None, Some(len)) => Some(len),
            (None, None) => None,
        }
    }

    /// Number of bytes the range covers, when resolvable.
    pub fn len(&self, source_length: Option<u64>) -> Option<u64> {
        self.end_exclusive(source_length)
            .map(|end| end.saturating_sub(self.start))
    }

    pub fn is_full_request(&self, source_length: Option<u64>) -> bool {
        if self.start != 0 {
            return false;
        }
        match self.end {
            None => true,
            Some(end) => source_length
                .map(|len| end == len.saturating_sub(1))
                .unwrap_or(false),
        }
    }
}

/// Parses a `Range: bytes=N-[M]` header value. Only single, positive
/// ranges are supported (spec.md §6); suffix ranges (`bytes=-500`) and
/// multi-ranges (`bytes=0-10,20-30`) return `None` so the caller can
/// respond `400 Bad Request`.
pub fn parse_range_header(value: &str) -> Option<IntRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    if rest.contains(',') {
        return None;
    }
    let (start_str, end_str) = rest.split_once('-')?;
    if start_str.is_empty() {
        // Negative suffix range — unsupported.
        return None;
    }
    let start: u64 = start_str.trim().parse().ok()?;
    let end = if end_str.trim().is_empty() {
        None
    } else {
        Some(end_str.trim().parse().ok()?)
    };
    if let Some(end) = end {
        if end < start {
            return None;
        }
    }
    Some(IntRange::new(start, end))
}
