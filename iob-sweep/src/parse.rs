// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, trace};
use regex::Regex;
use serde_json::Value;

use iob_sweep_intf::{Field, Measurement, Operation};

/// Plain decimal or scientific notation, e.g. "4500.0" or "1.23e+05".
const NUM: &str = r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?";

/// (target field, pattern, scale) rules for the native load generator's
/// summary. `{NUM}` is substituted with the number pattern which is the
/// only capture group. For each field the first matching line of the first
/// rule which matches anywhere wins.
const TEXT_RULES: &[(Field, &str, f64)] = &[
    (Field::Iops, r"Throughput:\s*({NUM})\s*IOPS", 1.0),
    (Field::Bw, r"Bandwidth:\s*({NUM})\s*MB/s", 1.0),
    (Field::Bw, r"Throughput:\s*({NUM})\s*MB/s", 1.0),
    (Field::Bw, r"Bandwidth:\s*({NUM})\s*GB/s", 1024.0),
    (Field::AvgLat, r"Average Latency:\s*({NUM})\s*(?:microseconds|us)", 1.0),
    (Field::AvgLat, r"Average Latency:\s*({NUM})\s*(?:milliseconds|ms)", 1000.0),
    (Field::MinLat, r"Min Latency:\s*({NUM})\s*(?:microseconds|us)", 1.0),
    (Field::MinLat, r"Min Latency:\s*({NUM})\s*(?:milliseconds|ms)", 1000.0),
    (Field::MaxLat, r"Max Latency:\s*({NUM})\s*(?:microseconds|us)", 1.0),
    (Field::MaxLat, r"Max Latency:\s*({NUM})\s*(?:milliseconds|ms)", 1000.0),
    (Field::TotalTime, r"Total Time:\s*({NUM})\s*(?:seconds|s)\b", 1.0),
    (Field::TotalIos, r"Total I/O Completed:\s*({NUM})", 1.0),
];

/// Candidate latency objects in a fio job's per-operation section, in
/// priority order, with the divisor to get microseconds. Newer fio
/// versions report in nanoseconds, older ones in microseconds.
const FIO_LAT_KEYS: &[(&str, f64)] = &[
    ("lat_ns", 1000.0),
    ("lat_us", 1.0),
    ("lat", 1.0),
    ("clat_ns", 1000.0),
    ("clat_us", 1.0),
    ("clat", 1.0),
];

lazy_static::lazy_static! {
    static ref TEXT_REGEXES: Vec<(Field, Regex, f64)> = TEXT_RULES
        .iter()
        .map(|(field, pat, scale)| {
            let pat = format!(r"(?m)^\s*{}", pat.replace("{NUM}", NUM));
            // The table is static, a bad pattern is a programming error.
            (*field, Regex::new(&pat).unwrap(), *scale)
        })
        .collect();
    static ref THREAD_HEADER: Regex = Regex::new(r"(?m)^\s*Thread\s+\d+\s+Results:").unwrap();
    static ref SUMMARY_START: Regex = Regex::new(r"(?m)^\s*Total I/O Completed:").unwrap();
}

fn parse_num(input: &str) -> Option<f64> {
    match input.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

fn parse_summary(text: &str) -> Measurement {
    let mut meas = Measurement::default();

    for (field, re, scale) in TEXT_REGEXES.iter() {
        if meas.get(*field).is_some() {
            continue;
        }
        let first = re
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).and_then(|m| parse_num(m.as_str())))
            .next();
        if let Some(v) = first {
            trace!("parse: {} = {} (scale {})", field, v, scale);
            meas.set(*field, v * scale);
        }
    }
    meas
}

/// Folds per-thread summaries into one. Rates and I/O counts add up, the
/// slowest thread decides the total time and the average latency is
/// weighted by I/O count. A field is only set if every thread reported it.
fn combine_threads(threads: &[Measurement]) -> Measurement {
    let mut meas = Measurement::default();
    if threads.is_empty() {
        return meas;
    }

    for field in Field::ALL.iter() {
        let vals: Vec<f64> = threads.iter().filter_map(|t| t.get(*field)).collect();
        if vals.len() < threads.len() {
            continue;
        }
        let v = match field {
            Field::Iops | Field::Bw | Field::TotalIos => vals.iter().sum::<f64>(),
            Field::TotalTime | Field::MaxLat => vals.iter().cloned().fold(std::f64::MIN, f64::max),
            Field::MinLat => vals.iter().cloned().fold(std::f64::MAX, f64::min),
            Field::AvgLat => {
                let ios: Vec<f64> = threads.iter().filter_map(|t| t.get(Field::TotalIos)).collect();
                let nr_ios: f64 = ios.iter().sum();
                if ios.len() == vals.len() && nr_ios > 0.0 {
                    vals.iter().zip(ios.iter()).map(|(lat, n)| lat * n).sum::<f64>() / nr_ios
                } else {
                    statistical::mean(&vals)
                }
            }
        };
        meas.set(*field, v);
    }
    meas
}

/// Parses the native load generator's textual summary. Never fails, fields
/// without a matching line are left empty. Output made only of per-thread
/// "Thread N Results:" blocks is combined into a whole-run summary.
pub fn parse_text(output: &str) -> Measurement {
    let starts: Vec<usize> = THREAD_HEADER.find_iter(output).map(|m| m.start()).collect();
    if starts.is_empty() {
        return parse_summary(output);
    }

    // An overall summary printed after the per-thread blocks wins.
    let summaries: Vec<usize> = SUMMARY_START.find_iter(output).map(|m| m.start()).collect();
    if summaries.len() > starts.len() {
        return parse_summary(&output[summaries[summaries.len() - 1]..]);
    }

    let threads: Vec<Measurement> = starts
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = starts.get(i + 1).cloned().unwrap_or(output.len());
            parse_summary(&output[*start..end])
        })
        .collect();
    debug!("parse: combining {} per-thread summaries", threads.len());
    combine_threads(&threads)
}

fn json_f64(val: &Value, key: &str) -> Option<f64> {
    val.get(key).and_then(|v| v.as_f64()).filter(|v| v.is_finite())
}

/// Parses fio's `--output-format=json` output for `op`. Anything before the
/// first '{' is ignored as fio may print warnings ahead of the json body.
/// Per-job iops, bandwidth and I/O counts are summed, latencies come from
/// the first job which reports them.
pub fn parse_fio_json(output: &str, op: Operation) -> Measurement {
    let mut meas = Measurement::default();

    let body = match output.find('{') {
        Some(pos) => &output[pos..],
        None => {
            debug!("parse: no json body in fio output");
            return meas;
        }
    };
    let top: Value = match serde_json::Deserializer::from_str(body)
        .into_iter::<Value>()
        .next()
    {
        Some(Ok(v)) => v,
        Some(Err(e)) => {
            debug!("parse: failed to parse fio json ({})", &e);
            return meas;
        }
        None => return meas,
    };
    let jobs = match top.get("jobs").and_then(|v| v.as_array()) {
        Some(v) => v,
        None => return meas,
    };

    let sections: Vec<&Value> = jobs.iter().filter_map(|job| job.get(op.name())).collect();

    let sum = |key: &str| -> Option<f64> {
        let vals: Vec<f64> = sections.iter().filter_map(|s| json_f64(s, key)).collect();
        if vals.is_empty() {
            None
        } else {
            Some(vals.iter().sum())
        }
    };

    meas.iops = sum("iops");
    // KiB/s
    meas.bw = sum("bw").map(|v| v / 1024.0);
    meas.total_ios = sum("total_ios").map(|v| v.round() as u64);
    // msecs, the longest job decides
    meas.total_time = sections
        .iter()
        .filter_map(|s| json_f64(s, "runtime"))
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
        .map(|v| v / 1000.0);

    'outer: for sect in sections.iter() {
        for (key, div) in FIO_LAT_KEYS.iter() {
            if let Some(lat) = sect.get(*key) {
                let mean = json_f64(lat, "mean");
                if mean.is_none() {
                    continue;
                }
                meas.avg_lat = mean.map(|v| v / div);
                meas.min_lat = json_f64(lat, "min").map(|v| v / div);
                meas.max_lat = json_f64(lat, "max").map(|v| v / div);
                break 'outer;
            }
        }
    }

    meas
}

/// Returns the last `nr_lines` lines of `output`, all of it if `nr_lines`
/// is 0.
pub fn tail_lines(output: &str, nr_lines: usize) -> String {
    if nr_lines == 0 {
        return output.to_string();
    }
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(nr_lines);
    let mut tail = lines[start..].join("\n");
    if output.ends_with('\n') && !tail.is_empty() {
        tail.push('\n');
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE_OUTPUT: &str = "\
Location: /dev/nvme0n1	Execution Type: Time-Based
	Threads: 4	Queue Depth: 8
-----
Thread 0: Elapsed Time: 1s, IOPS: 30211, Bandwidth: 118.01 MB/s
All Threads: IOPS: 120844, Bandwidth: 472.04 MB/s
-----
Total I/O Completed: 3625320
Total Data Size: 14161.4 MB
Total Time: 30.0004 seconds
Throughput: 1.20841e+05 IOPS
Bandwidth: 472.04 MB/s
";

    #[test]
    fn test_scientific_and_plain() {
        let _ = ::env_logger::try_init();
        assert_eq!(parse_text("Throughput: 1.23e+05 IOPS").iops, Some(123000.0));
        assert_eq!(parse_text("Throughput: 4500.0 IOPS").iops, Some(4500.0));
        assert_eq!(parse_text("Throughput: 4500.0 IOPS").bw, None);
        assert_eq!(parse_text("Throughput: 2E3 IOPS").iops, Some(2000.0));
    }

    #[test]
    fn test_native_summary() {
        let _ = ::env_logger::try_init();
        let meas = parse_text(NATIVE_OUTPUT);
        assert_eq!(meas.iops, Some(120841.0));
        assert_eq!(meas.bw, Some(472.04));
        assert_eq!(meas.total_ios, Some(3625320));
        assert_eq!(meas.total_time, Some(30.0004));
        assert_eq!(meas.avg_lat, None);
    }

    #[test]
    fn test_per_thread_summaries() {
        let _ = ::env_logger::try_init();
        let output = "\
Thread 0 Results:
Total I/O Completed: 1000
Total Time: 2 seconds
Throughput: 500 IOPS
Throughput: 1.95312 MB/s
Average Latency: 1980 microseconds
Min Latency: 12 microseconds
Max Latency: 1.5e+04 microseconds
Thread 1 Results:
Total I/O Completed: 1200
Total Time: 2 seconds
Throughput: 600 IOPS
Throughput: 2.34375 MB/s
Average Latency: 1650 microseconds
Min Latency: 10 microseconds
Max Latency: 9000 microseconds
";
        let meas = parse_text(output);
        assert_eq!(meas.iops, Some(1100.0));
        assert!((meas.bw.unwrap() - 4.29687).abs() < 1e-9);
        // (1980 * 1000 + 1650 * 1200) / 2200
        assert_eq!(meas.avg_lat, Some(1800.0));
        assert_eq!(meas.min_lat, Some(10.0));
        assert_eq!(meas.max_lat, Some(15000.0));
        assert_eq!(meas.total_ios, Some(2200));
        assert_eq!(meas.total_time, Some(2.0));

        // a thread which didn't report latency leaves the combined one empty
        let partial = output.replace("Average Latency: 1650 microseconds\n", "");
        let meas = parse_text(&partial);
        assert_eq!(meas.avg_lat, None);
        assert_eq!(meas.iops, Some(1100.0));

        // an overall summary after the threads is used as is
        let with_total = format!(
            "{}Total I/O Completed: 2200\nTotal Time: 2 seconds\nThroughput: 1111 IOPS\n",
            output
        );
        let meas = parse_text(&with_total);
        assert_eq!(meas.iops, Some(1111.0));
        assert_eq!(meas.total_ios, Some(2200));
        assert_eq!(meas.avg_lat, None);
    }

    #[test]
    fn test_garbage() {
        let _ = ::env_logger::try_init();
        assert!(parse_text("").is_empty());
        assert!(parse_text("Throughput: nan IOPS\nBandwidth: -- MB/s").is_empty());
        assert!(parse_fio_json("fio: failed", Operation::Read).is_empty());
        assert!(parse_fio_json("{ \"jobs\": [", Operation::Read).is_empty());
    }

    #[test]
    fn test_fio_json() {
        let _ = ::env_logger::try_init();
        let output = r#"note: both iodepth >= 1 and synchronous I/O engine are selected
{
  "fio version" : "fio-3.36",
  "jobs" : [
    {
      "jobname" : "iob",
      "read" : {
        "io_bytes" : 1048576000,
        "bw" : 512000,
        "iops" : 128000.5,
        "runtime" : 30001,
        "total_ios" : 3840015,
        "lat_ns" : { "min" : 9000, "max" : 1500000, "mean" : 62500.0 }
      },
      "write" : { "bw" : 0, "iops" : 0.0, "runtime" : 0, "total_ios" : 0 }
    }
  ]
}
"#;
        let meas = parse_fio_json(output, Operation::Read);
        assert_eq!(meas.iops, Some(128000.5));
        assert_eq!(meas.bw, Some(500.0));
        assert_eq!(meas.avg_lat, Some(62.5));
        assert_eq!(meas.min_lat, Some(9.0));
        assert_eq!(meas.max_lat, Some(1500.0));
        assert_eq!(meas.total_ios, Some(3840015));
        assert_eq!(meas.total_time, Some(30.001));

        let meas = parse_fio_json(output, Operation::Write);
        assert_eq!(meas.iops, Some(0.0));
        assert_eq!(meas.avg_lat, None);
    }

    #[test]
    fn test_fio_old_lat_key() {
        let _ = ::env_logger::try_init();
        let output = r#"{ "jobs": [ { "write": { "iops": 10, "bw": 40,
            "clat": { "mean": 100.0 }, "lat": { "mean": 120.0 } } } ] }"#;
        let meas = parse_fio_json(output, Operation::Write);
        assert_eq!(meas.avg_lat, Some(120.0));
        assert_eq!(meas.min_lat, None);
    }

    #[test]
    fn test_tail_lines() {
        let _ = ::env_logger::try_init();
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb\nc", 5), "a\nb\nc");
        assert_eq!(tail_lines("a\nb\nc", 0), "a\nb\nc");
    }
}
