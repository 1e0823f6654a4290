// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

use super::{Series, SeriesAligner, SeriesSample};
use iob_sweep_intf::{AccessMethod, Field, Operation, ResultRecord};
use iob_util::*;

fn checked_div(num: Option<f64>, den: Option<f64>) -> Option<f64> {
    match (num, den) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d).filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Elementwise `variant / baseline`. Missing wherever the baseline is zero
/// or either side is missing. The result is as long as the longer input.
pub fn ratio(baseline: &[Option<f64>], variant: &[Option<f64>]) -> Vec<Option<f64>> {
    let len = baseline.len().max(variant.len());
    (0..len)
        .map(|i| {
            checked_div(
                variant.get(i).cloned().flatten(),
                baseline.get(i).cloned().flatten(),
            )
        })
        .collect()
}

/// `vals[i] / vals[i - 1]` with the same missing rules as `ratio()`. The
/// first element has no predecessor and is always missing.
pub fn step_factors(vals: &[Option<f64>]) -> Vec<Option<f64>> {
    (0..vals.len())
        .map(|i| match i {
            0 => None,
            i => checked_div(vals[i], vals[i - 1]),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioSummary {
    pub nr_valid: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn summarize(vals: &[Option<f64>]) -> RatioSummary {
    let data: Vec<f64> = vals.iter().filter_map(|v| *v).collect();
    if data.is_empty() {
        return Default::default();
    }
    RatioSummary {
        nr_valid: data.len(),
        mean: Some(statistical::mean(&data)),
        min: Some(data.iter().cloned().fold(std::f64::MAX, f64::min)),
        max: Some(data.iter().cloned().fold(std::f64::MIN, f64::max)),
    }
}

/// Baseline and variant engines side by side over the queue depth axis for
/// one (operation, method, threads, page size, duration) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineComparison {
    pub operation: Operation,
    pub method: AccessMethod,
    pub threads: u32,
    pub page_size: u64,
    pub duration: u64,
    pub queue_depths: Vec<u32>,
    pub baseline: Vec<Option<f64>>,
    pub variant: Vec<Option<f64>>,
    pub ratio: Vec<Option<f64>>,
    pub variant_steps: Vec<Option<f64>>,
    pub baseline_broadcast: bool,
    pub variant_broadcast: bool,
}

type GroupKey = (Operation, AccessMethod, u32, u64, u64);

#[derive(Default)]
struct EngineGroup {
    // queue depth -> metric values over runs
    by_qd: BTreeMap<u32, Vec<f64>>,
    broadcast: bool,
}

impl EngineGroup {
    fn series(&self) -> Series {
        Series::from_lossy(
            self.by_qd
                .iter()
                .map(|(qd, vals)| {
                    let mean = match vals.len() {
                        0 => None,
                        _ => Some(statistical::mean(vals)),
                    };
                    SeriesSample::new(*qd as f64, mean)
                })
                .collect(),
        )
    }
}

/// Rejects engine pairs which can't be compared.
pub fn check_engines(baseline: &str, variant: &str) -> Result<()> {
    if baseline == variant {
        bail!("baseline and variant are both {:?}", baseline);
    }
    Ok(())
}

/// Compares `metric` of the `variant` engine against `baseline` for every
/// group present in `records`. Runs are averaged per queue depth and both
/// engines are aligned onto the union of their queue depths.
pub fn compare_engines(
    records: &[ResultRecord],
    baseline: &str,
    variant: &str,
    metric: Field,
) -> Vec<EngineComparison> {
    let mut groups: BTreeMap<GroupKey, (EngineGroup, EngineGroup)> = BTreeMap::new();

    for rec in records.iter() {
        let p = &rec.point;
        let key = (p.operation, p.method, p.threads, p.page_size, p.duration);
        let is_base = p.engine == baseline;
        if !is_base && p.engine != variant {
            continue;
        }
        let pair = groups.entry(key).or_default();
        let grp = if is_base { &mut pair.0 } else { &mut pair.1 };
        let vals = grp.by_qd.entry(p.queue_depth).or_default();
        if let Some(v) = rec.meas.get(metric) {
            vals.push(v);
        }
        grp.broadcast |= rec.is_broadcast();
    }

    let mut cmps = vec![];
    for (key, (base, var)) in groups.iter() {
        let mut qds: Vec<u32> = base.by_qd.keys().chain(var.by_qd.keys()).cloned().collect();
        qds.sort();
        qds.dedup();

        let frame = SeriesAligner::new(qds.iter().map(|qd| *qd as f64).collect())
            .add("baseline", base.series(), 0)
            .add("variant", var.series(), 0)
            .align();
        let base_vals = frame.columns["baseline"].clone();
        let var_vals = frame.columns["variant"].clone();

        cmps.push(EngineComparison {
            operation: key.0,
            method: key.1,
            threads: key.2,
            page_size: key.3,
            duration: key.4,
            ratio: ratio(&base_vals, &var_vals),
            variant_steps: step_factors(&var_vals),
            queue_depths: qds,
            baseline: base_vals,
            variant: var_vals,
            baseline_broadcast: base.broadcast,
            variant_broadcast: var.broadcast,
        });
    }
    cmps
}

fn fmt_val(v: Option<f64>, metric: Field) -> String {
    match metric {
        Field::Iops | Field::TotalIos => format_opt(v, format_count),
        _ => format_opt(v, |v| format!("{:.2}", v)),
    }
}

fn fmt_factor(v: Option<f64>) -> String {
    format_opt(v, |v| format!("{:.2}x", v))
}

pub fn format_comparisons(
    out: &mut String,
    cmps: &[EngineComparison],
    baseline: &str,
    variant: &str,
    metric: Field,
) {
    for cmp in cmps.iter() {
        writeln!(
            out,
            "{}",
            underline(&format!(
                "{} {} threads={} bs={} dur={}s: {} {} vs {}",
                cmp.operation,
                cmp.method,
                cmp.threads,
                format_size(cmp.page_size),
                cmp.duration,
                metric,
                variant,
                baseline
            ))
        )
        .unwrap();
        let broadcast: Vec<&str> = [
            (cmp.baseline_broadcast, baseline),
            (cmp.variant_broadcast, variant),
        ]
        .iter()
        .filter(|(bc, _)| *bc)
        .map(|(_, name)| *name)
        .collect();
        match broadcast.len() {
            0 => (),
            1 => writeln!(
                out,
                "  ({} is queue depth invariant by assumption, its values are broadcast)",
                broadcast[0]
            )
            .unwrap(),
            _ => writeln!(
                out,
                "  ({} are queue depth invariant by assumption, their values are broadcast)",
                broadcast.join(" and ")
            )
            .unwrap(),
        }
        writeln!(
            out,
            "  {:>5}  {:>10}  {:>10}  {:>8}  {:>8}",
            "QD", baseline, variant, "ratio", "step"
        )
        .unwrap();
        for (i, qd) in cmp.queue_depths.iter().enumerate() {
            writeln!(
                out,
                "  {:>5}  {:>10}  {:>10}  {:>8}  {:>8}",
                qd,
                fmt_val(cmp.baseline[i], metric),
                fmt_val(cmp.variant[i], metric),
                fmt_factor(cmp.ratio[i]),
                fmt_factor(cmp.variant_steps[i]),
            )
            .unwrap();
        }
        let sum = summarize(&cmp.ratio);
        writeln!(
            out,
            "  ratio mean={} min={} max={} over {} depths\n",
            fmt_factor(sum.mean),
            fmt_factor(sum.min),
            fmt_factor(sum.max),
            sum.nr_valid
        )
        .unwrap();
    }
}
