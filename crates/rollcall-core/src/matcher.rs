//! Single-nearest-neighbor classification with a hard rejection radius.

use crate::extractor::Metric;
use crate::registry::Registry;
use crate::types::{Identity, MatchResult, Signature};

/// Accepts the nearest registry entry only when it is strictly closer than
/// `threshold`. Rejections are preferred over false accepts, so the
/// threshold should be tuned conservatively.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestMatcher {
    pub threshold: f32,
}

impl NearestMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify `query` against every registry entry.
    ///
    /// Equidistant entries resolve to the lowest registry index. NaN
    /// distances never win. An empty registry always yields
    /// [`Identity::Unknown`] with no distance.
    pub fn compare<M: Metric + ?Sized>(
        &self,
        query: &Signature,
        registry: &Registry,
        metric: &M,
    ) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in registry.entries().iter().enumerate() {
            let d = metric.distance(query, &entry.signature);
            if d.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) if d < self.threshold => MatchResult {
                identity: Identity::Known(registry.entries()[idx].label.clone()),
                distance: Some(d),
            },
            Some((_, d)) => MatchResult {
                identity: Identity::Unknown,
                distance: Some(d),
            },
            None => MatchResult::unknown(),
        }
    }
}
