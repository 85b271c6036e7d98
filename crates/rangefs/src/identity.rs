// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote resource identity and byte ranges

use serde::{Deserialize, Serialize};
use std::fmt;

/// What one HTTP exchange revealed about the remote resource.
///
/// The ETag is the authority for "has the content changed". When the server
/// sends none, [`ResourceIdentity::validator`] falls back to a weak
/// validator built from Last-Modified and the size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub url: String,
    pub size: u64,
    pub etag: Option<String>,
    pub accepts_ranges: bool,
    pub last_modified: Option<String>,
}

impl ResourceIdentity {
    /// Token compared against cache entry validators.
    #[must_use]
    pub fn validator(&self) -> String {
        match (&self.etag, &self.last_modified) {
            (Some(etag), _) => etag.clone(),
            (None, Some(modified)) => format!("W/{}:{}", modified, self.size),
            (None, None) => format!("W/size:{}", self.size),
        }
    }

    /// True when the validator is derived rather than server supplied.
    #[must_use]
    pub fn has_weak_validator(&self) -> bool {
        self.etag.is_none()
    }

    /// The whole resource as a range.
    #[must_use]
    pub fn full_range(&self) -> ByteRange {
        ByteRange::new(0, self.size)
    }

    /// Validate that `range` lies within the resource.
    pub fn check_range(&self, range: ByteRange) -> crate::Result<()> {
        if range.end() > self.size {
            return Err(crate::RangeError::usage(format!(
                "range {} exceeds size {} of {}",
                range, self.size, self.url
            )));
        }
        Ok(())
    }
}

/// A contiguous span of the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Range covering `[start, end)`.
    #[must_use]
    pub fn from_bounds(start: u64, end: u64) -> Self {
        Self::new(start, end.saturating_sub(start))
    }

    /// Exclusive end offset
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True if `other` lies entirely within `self`.
    #[must_use]
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Value for the HTTP `Range` header (inclusive end).
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }

    /// Merge ranges whose gap is at most `max_gap` bytes. The input order
    /// does not matter; the output is sorted by offset.
    #[must_use]
    pub fn coalesce(mut ranges: Vec<ByteRange>, max_gap: u64) -> Vec<ByteRange> {
        ranges.retain(|r| !r.is_empty());
        ranges.sort();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.offset <= last.end().saturating_add(max_gap) => {
                    let end = last.end().max(range.end());
                    *last = ByteRange::from_bounds(last.offset, end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `None` for the unsatisfied form `bytes */total`
    pub range: Option<ByteRange>,
    /// `None` when the server answers `*` for the total
    pub total: Option<u64>,
}

impl ContentRange {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        let range = match span.trim() {
            "*" => None,
            s => {
                let (start, end) = s.split_once('-')?;
                let start = start.trim().parse::<u64>().ok()?;
                let end = end.trim().parse::<u64>().ok()?;
                if end < start {
                    return None;
                }
                Some(ByteRange::from_bounds(start, end + 1))
            }
        };
        Some(Self { range, total })
    }
}
