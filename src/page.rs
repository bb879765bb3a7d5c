//! Paged listing.

use serde::{Deserialize, Serialize};

/// Requested page. `index` is zero-based, `size` is one-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub index: i64,
    pub size: i64,
}

impl PageRequest {
    pub fn new(index: i64, size: i64) -> Self {
        Self { index, size }
    }

    /// `OFFSET` and `LIMIT` for this page, or `None` when the request cannot
    /// select anything.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        if self.index < 0 || self.size < 1 {
            return None;
        }

        let offset = self.index.checked_mul(self.size)?;
        Some((offset, self.size))
    }
}

/// One page of results with the number of rows matching overall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn empty(total: i64) -> Self {
        Self {
            items: Vec::new(),
            total,
        }
    }
}

/// Escape `%`, `_` and `\` so `pattern` matches literally inside `LIKE`.
pub(crate) fn contains_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('%');
    for c in pattern.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert_eq!(PageRequest::new(0, 10).bounds(), Some((0, 10)));
        assert_eq!(PageRequest::new(3, 25).bounds(), Some((75, 25)));
        assert_eq!(PageRequest::new(-1, 10).bounds(), None);
        assert_eq!(PageRequest::new(0, 0).bounds(), None);
        assert_eq!(PageRequest::new(0, -5).bounds(), None);
        assert_eq!(PageRequest::new(i64::MAX, 2).bounds(), None);
    }

    #[test]
    fn test_contains_pattern() {
        assert_eq!(contains_pattern("ali"), "%ali%");
        assert_eq!(contains_pattern("50%_off"), r"%50\%\_off%");
        assert_eq!(contains_pattern(r"a\b"), r"%a\\b%");
        assert_eq!(contains_pattern(""), "%%");
    }
}
