// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod compare;
pub mod monlog;

pub use compare::{compare_engines, ratio, step_factors, summarize, RatioSummary};
pub use monlog::{parse_iostat, parse_progress, parse_sar_cpu, read_log};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesSample {
    pub idx: f64,
    pub val: Option<f64>,
}

impl SeriesSample {
    pub fn new(idx: f64, val: Option<f64>) -> Self {
        Self { idx, val }
    }
}

/// Samples ordered by strictly increasing index. Values may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    samples: Vec<SeriesSample>,
}

impl Series {
    pub fn new(samples: Vec<SeriesSample>) -> Result<Self> {
        for (i, s) in samples.iter().enumerate() {
            if !s.idx.is_finite() {
                bail!("non-finite index {} at position {}", s.idx, i);
            }
            if i > 0 && samples[i - 1].idx >= s.idx {
                bail!(
                    "index {} at position {} doesn't increase over {}",
                    s.idx,
                    i,
                    samples[i - 1].idx
                );
            }
        }
        Ok(Self { samples })
    }

    /// Sorts by index and drops samples with non-finite or repeated
    /// indices. The first sample at an index wins.
    pub fn from_lossy(mut samples: Vec<SeriesSample>) -> Self {
        samples.retain(|s| s.idx.is_finite());
        samples.sort_by(|a, b| a.idx.partial_cmp(&b.idx).unwrap_or(std::cmp::Ordering::Equal));
        samples.dedup_by(|b, a| a.idx == b.idx);
        Self { samples }
    }

    /// Consecutive integer indices starting at `start`.
    pub fn from_values(start: i64, vals: &[Option<f64>]) -> Self {
        Self {
            samples: vals
                .iter()
                .enumerate()
                .map(|(i, v)| SeriesSample::new((start + i as i64) as f64, *v))
                .collect(),
        }
    }

    pub fn samples(&self) -> &[SeriesSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn shifted(&self, shift: i64) -> Self {
        Self {
            samples: self
                .samples
                .iter()
                .map(|s| SeriesSample::new(s.idx + shift as f64, s.val))
                .collect(),
        }
    }

    fn known(&self) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| match s.val {
                Some(v) if v.is_finite() => Some((s.idx, v)),
                _ => None,
            })
            .collect()
    }

    /// Looks up `domain` indices. Exact samples are used as is, indices
    /// between two known samples are linearly interpolated and indices past
    /// either end take the nearest known value. If the known samples don't
    /// overlap the domain's range at all, everything is missing. Samples
    /// with missing values are gaps.
    pub fn reindex(&self, domain: &[f64]) -> Vec<Option<f64>> {
        let known = self.known();
        let dmin = domain.iter().cloned().fold(f64::INFINITY, f64::min);
        let dmax = domain.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let (first, last) = match (known.first(), known.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return vec![None; domain.len()],
        };
        if last.0 < dmin || first.0 > dmax {
            trace!(
                "study: samples [{}, {}] miss domain [{}, {}]",
                first.0,
                last.0,
                dmin,
                dmax
            );
            return vec![None; domain.len()];
        }

        domain
            .iter()
            .map(|&d| {
                if !d.is_finite() {
                    return None;
                }
                if d <= first.0 {
                    return Some(first.1);
                }
                if d >= last.0 {
                    return Some(last.1);
                }
                // first.0 < d < last.0, so 0 < pos < known.len()
                let pos = known.partition_point(|(idx, _)| *idx < d);
                let (hi_idx, hi_val) = known[pos];
                if hi_idx == d {
                    return Some(hi_val);
                }
                let (lo_idx, lo_val) = known[pos - 1];
                Some(lo_val + (hi_val - lo_val) * (d - lo_idx) / (hi_idx - lo_idx))
            })
            .collect()
    }
}

/// Named value columns sharing one index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignedFrame {
    pub index: Vec<f64>,
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl AlignedFrame {
    pub fn new(index: Vec<f64>) -> Self {
        Self {
            index,
            columns: BTreeMap::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    /// Adds or replaces a column. Its length must match the index.
    pub fn insert(&mut self, name: &str, vals: Vec<Option<f64>>) -> Result<()> {
        if vals.len() != self.index.len() {
            bail!(
                "column {:?} has {} values for {} indices",
                name,
                vals.len(),
                self.index.len()
            );
        }
        self.columns.insert(name.to_string(), vals);
        Ok(())
    }
}

/// Integer index domain `start..=end`.
pub fn int_domain(start: i64, end: i64) -> Vec<f64> {
    (start..=end).map(|v| v as f64).collect()
}

/// Reindexes independently sampled series onto a caller supplied domain.
/// Each series can carry an integer shift which is added to its indices
/// first to compensate for a known start skew.
pub struct SeriesAligner {
    domain: Vec<f64>,
    inputs: Vec<(String, Series, i64)>,
}

impl SeriesAligner {
    pub fn new(domain: Vec<f64>) -> Self {
        Self {
            domain,
            inputs: vec![],
        }
    }

    pub fn add(mut self, name: &str, series: Series, shift: i64) -> Self {
        self.inputs.push((name.to_string(), series, shift));
        self
    }

    pub fn align(&self) -> AlignedFrame {
        let mut frame = AlignedFrame::new(self.domain.clone());
        for (name, series, shift) in self.inputs.iter() {
            let vals = series.shifted(*shift).reindex(&self.domain);
            frame.columns.insert(name.clone(), vals);
        }
        frame
    }
}
