use anyhow::{anyhow, Result};

use crate::timeseries::{Extent, MatrixEnvelope};

/// Outcome of comparing a requested extent against cached coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    KeyMiss,
    RangeMiss,
    Hit,
    PartialHit,
    Purge,
}

impl CacheLookup {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheLookup::KeyMiss => "kmiss",
            CacheLookup::RangeMiss => "rmiss",
            CacheLookup::Hit => "hit",
            CacheLookup::PartialHit => "phit",
            CacheLookup::Purge => "purge",
        }
    }
}

/// A classification plus the origin-fetch extents needed to fill the
/// gaps, at most one per side.
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub lookup: CacheLookup,
    pub lower: Option<Extent>,
    pub upper: Option<Extent>,
}

impl Resolution {
    fn fetch_all(lookup: CacheLookup, request: Extent) -> Self {
        Self {
            lookup,
            lower: None,
            upper: Some(request),
        }
    }
}

/// Normalizes a requested range: the end is clamped to the present so
/// charts don't run past now, then both bounds are floor-aligned to the
/// step. Reversed ranges and non-positive steps are client errors.
pub fn align_step_boundaries(
    start: i64,
    end: i64,
    step_ms: i64,
    now_ms: i64,
) -> Result<(i64, i64)> {
    let end = end.min(now_ms);

    if start > end {
        return Err(anyhow!("start is after end"));
    }
    if step_ms <= 0 {
        return Err(anyhow!("step must be > 0"));
    }

    Ok(((start / step_ms) * step_ms, (end / step_ms) * step_ms))
}

/// Classifies a step-aligned request against the cached dataset and
/// computes the missing sub-ranges.
///
/// `bypass` (the no-cache directive) forces a full refetch regardless
/// of cache contents; the result is still written back afterward.
pub fn resolve(
    request: Extent,
    step_ms: i64,
    cached: Option<&MatrixEnvelope>,
    bypass: bool,
) -> Result<Resolution> {
    if bypass {
        return Ok(Resolution::fetch_all(CacheLookup::Purge, request));
    }

    let Some(matrix) = cached else {
        return Ok(Resolution::fetch_all(CacheLookup::KeyMiss, request));
    };

    let cached_extent = matrix.extents();
    if cached_extent.is_unset() {
        // A cached entry with no data points covers nothing.
        return Ok(Resolution::fetch_all(CacheLookup::RangeMiss, request));
    }

    let c = cached_extent;
    let r = request;

    if r.start >= c.start && r.end <= c.end {
        // Everything requested is already in cache.
        return Ok(Resolution {
            lookup: CacheLookup::Hit,
            lower: None,
            upper: None,
        });
    }

    if r.start < c.start && r.end > c.end {
        return Ok(Resolution {
            lookup: CacheLookup::PartialHit,
            lower: Some(Extent::new(r.start, c.start - step_ms)),
            upper: Some(Extent::new(c.end + step_ms, r.end)),
        });
    }

    if r.start > c.end {
        // The whole request is beyond the cached data.
        return Ok(Resolution {
            lookup: CacheLookup::RangeMiss,
            lower: None,
            upper: Some(Extent::new(c.end + step_ms, r.end)),
        });
    }

    if r.end > c.end {
        return Ok(Resolution {
            lookup: CacheLookup::PartialHit,
            lower: None,
            upper: Some(Extent::new(c.end + step_ms, r.end)),
        });
    }

    if r.end < c.start {
        // The whole request predates the cached data.
        return Ok(Resolution {
            lookup: CacheLookup::RangeMiss,
            lower: Some(Extent::new(r.start, c.start - step_ms)),
            upper: None,
        });
    }

    if r.start < c.start {
        return Ok(Resolution {
            lookup: CacheLookup::PartialHit,
            lower: Some(Extent::new(r.start, c.start - step_ms)),
            upper: None,
        });
    }

    // The ladder above is exhaustive for aligned extents.
    Err(anyhow!(
        "unreachable extent comparison: reqStart={} reqEnd={} cacheStart={} cacheEnd={}",
        r.start,
        r.end,
        c.start,
        c.end
    ))
}
