// Copyright (c) Facebook, Inc. and its affiliates.
use std::collections::BTreeMap;
use std::fmt::Write;

use iob_sweep_intf::{AccessMethod, Operation, ResultRecord};
use iob_util::*;

fn fmt_usecs(v: Option<f64>) -> String {
    format_opt(v, |v| format_duration(v * USEC))
}

/// Prints the ledger grouped by (engine, operation, method). Rows whose
/// values were copied from another queue depth are marked with `*`.
pub fn format_records(out: &mut String, records: &[ResultRecord]) {
    let mut groups: BTreeMap<(&str, Operation, AccessMethod), Vec<&ResultRecord>> =
        BTreeMap::new();
    for rec in records.iter() {
        groups
            .entry((rec.point.engine.as_str(), rec.point.operation, rec.point.method))
            .or_default()
            .push(rec);
    }

    let mut nr_broadcast = 0;
    for ((engine, op, method), mut recs) in groups.into_iter() {
        recs.sort_by(|a, b| a.point.cmp(&b.point));

        writeln!(out, "{}", underline(&format!("{} {} {}", engine, op, method))).unwrap();
        writeln!(
            out,
            "{:>7} {:>5} {:>6} {:>5} {:>3} {:>8} {:>9} {:>8} {:>8} {:>8}",
            "threads", "QD", "bs", "dur", "run", "IOPS", "MB/s", "lat-avg", "lat-min", "lat-max"
        )
        .unwrap();

        for rec in recs.iter() {
            let p = &rec.point;
            let m = &rec.meas;
            let qd = if rec.is_broadcast() {
                nr_broadcast += 1;
                format!("{}*", p.queue_depth)
            } else {
                format!("{}", p.queue_depth)
            };
            writeln!(
                out,
                "{:>7} {:>5} {:>6} {:>5} {:>3} {:>8} {:>9} {:>8} {:>8} {:>8}",
                p.threads,
                qd,
                format_size(p.page_size),
                format!("{}s", p.duration),
                p.run_idx,
                format_opt(m.iops, format_count),
                format_opt(m.bw, |v| format!("{:.2}", v)),
                fmt_usecs(m.avg_lat),
                fmt_usecs(m.min_lat),
                fmt_usecs(m.max_lat),
            )
            .unwrap();
        }
        writeln!(out).unwrap();
    }

    let first = records.iter().map(|r| r.recorded_at).min();
    let last = records.iter().map(|r| r.recorded_at).max();
    if let (Some(first), Some(last)) = (first, last) {
        writeln!(
            out,
            "{} row(s) recorded between {} and {}",
            records.len(),
            format_unix_time(first),
            format_unix_time(last)
        )
        .unwrap();
    }
    if nr_broadcast > 0 {
        writeln!(
            out,
            "* {} row(s) measured at another queue depth and broadcast",
            nr_broadcast
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iob_sweep_intf::{Measurement, ParameterPoint};

    fn rec(engine: &str, op: Operation, qd: u32) -> ResultRecord {
        let mut meas = Measurement::default();
        meas.iops = Some(81234.0);
        meas.bw = Some(317.32);
        meas.avg_lat = Some(12.5);
        ResultRecord::new(
            ParameterPoint {
                engine: engine.into(),
                operation: op,
                method: AccessMethod::Rand,
                threads: 4,
                queue_depth: qd,
                page_size: 4096,
                duration: 30,
                run_idx: 0,
            },
            meas,
            0,
        )
    }

    #[test]
    fn test_format_records() {
        let _ = ::env_logger::try_init();
        let base = rec("sync", Operation::Read, 1);
        let records = vec![
            rec("io_uring", Operation::Write, 8),
            base.broadcast_to(8),
            base.clone(),
            rec("io_uring", Operation::Write, 1),
        ];
        let mut out = String::new();
        format_records(&mut out, &records);

        let sync_hdr = out.find("sync read rand").unwrap();
        let uring_hdr = out.find("io_uring write rand").unwrap();
        assert!(uring_hdr < sync_hdr);
        assert!(out.contains("8*"));
        assert!(!out.contains("1*"));
        assert!(out.contains("317.32"));
        assert!(out.contains("1 row(s) measured at another queue depth"));
        assert!(out.contains("4 row(s) recorded between"));
        // missing latencies print as dashes
        assert!(out.lines().any(|l| l.ends_with(" -")));
    }

    #[test]
    fn test_format_empty() {
        let _ = ::env_logger::try_init();
        let mut out = String::new();
        format_records(&mut out, &[]);
        assert_eq!(out, "");
    }
}
