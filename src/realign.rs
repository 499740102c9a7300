//! Time-grid realignment.
//!
//! Raw store rows are irregularly sampled. Per distinct tag-set they are
//! bucketed onto a fixed-interval grid, interior gaps are filled by linear
//! interpolation, and grid points without a bounding neighbor on one side
//! are left unfilled and dropped.

use std::collections::BTreeMap;

use crate::types::{InstantVector, RangeVector, Sample, Series, StoreRow, TagSet, Window};

/// How raw samples landing in the same grid bucket combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketAgg {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
    Last,
}

impl BucketAgg {
    fn combine(self, values: &[f64]) -> f64 {
        match self {
            BucketAgg::Mean => values.iter().sum::<f64>() / values.len() as f64,
            BucketAgg::Sum => values.iter().sum(),
            BucketAgg::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            BucketAgg::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            BucketAgg::Last => values[values.len() - 1],
        }
    }
}

/// Reindex rows onto an `interval`-second grid per tag-set.
///
/// A window widens the grid to cover the full requested span; the widened
/// edges stay empty unless data bounds them, matching the no-extrapolation
/// policy.
pub fn realign(
    rows: Vec<StoreRow>,
    interval: u64,
    window: Option<Window>,
    agg: BucketAgg,
) -> RangeVector {
    let interval = interval.max(1) as i64;
    let mut grouped: BTreeMap<TagSet, Vec<(i64, f64)>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(row.tags)
            .or_default()
            .push((row.timestamp, row.value));
    }

    let mut out = Vec::new();
    for (labels, mut points) in grouped {
        // duplicate timestamps within one tag-set: the last write wins
        points.sort_by_key(|(t, _)| *t);
        points.reverse();
        points.dedup_by_key(|(t, _)| *t);
        points.reverse();
        if points.is_empty() {
            continue;
        }

        let mut span_start = points[0].0;
        let mut span_end = points[points.len() - 1].0;
        if let Some(w) = window {
            span_start = span_start.min(w.start);
            span_end = span_end.max(w.end);
        }
        let grid_start = span_start.div_euclid(interval) * interval;
        let grid_end = if span_end.rem_euclid(interval) == 0 {
            span_end
        } else {
            span_end.div_euclid(interval) * interval + interval
        };

        // bucket [t, t + interval) -> grid point t
        let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for (t, v) in &points {
            buckets.entry(t.div_euclid(interval) * interval).or_default().push(*v);
        }

        let mut grid: Vec<(i64, Option<f64>)> = Vec::new();
        let mut t = grid_start;
        while t <= grid_end {
            grid.push((t, buckets.get(&t).map(|vs| agg.combine(vs))));
            t += interval;
        }

        interpolate_gaps(&mut grid);
        let series_points: Vec<(i64, f64)> = grid
            .into_iter()
            .filter_map(|(t, v)| v.map(|v| (t, v)))
            .collect();
        if !series_points.is_empty() {
            out.push(Series {
                labels,
                points: series_points,
            });
        }
    }
    out
}

/// Fill interior `None`s linearly between the nearest known neighbors.
/// Leading and trailing gaps have no bounding pair and stay `None`.
fn interpolate_gaps(grid: &mut [(i64, Option<f64>)]) {
    let mut prev_known: Option<usize> = None;
    let mut i = 0;
    while i < grid.len() {
        if grid[i].1.is_some() {
            if let Some(p) = prev_known {
                if i > p + 1 {
                    let (t0, v0) = (grid[p].0, grid[p].1.unwrap_or_default());
                    let (t1, v1) = (grid[i].0, grid[i].1.unwrap_or_default());
                    for j in (p + 1)..i {
                        let frac = (grid[j].0 - t0) as f64 / (t1 - t0) as f64;
                        grid[j].1 = Some(v0 + (v1 - v0) * frac);
                    }
                }
            }
            prev_known = Some(i);
        }
        i += 1;
    }
}

/// Last value at-or-before `at` per tag-set: the instant-vector view of a
/// row set.
pub fn latest(rows: Vec<StoreRow>, at: i64) -> InstantVector {
    let mut newest: BTreeMap<TagSet, (i64, f64)> = BTreeMap::new();
    for row in rows {
        if row.timestamp > at {
            continue;
        }
        match newest.get(&row.tags) {
            Some((t, _)) if *t >= row.timestamp => {}
            _ => {
                newest.insert(row.tags, (row.timestamp, row.value));
            }
        }
    }
    newest
        .into_iter()
        .map(|(labels, (timestamp, value))| Sample {
            labels,
            timestamp,
            value,
        })
        .collect()
}
