// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::engine::find_engine;
use super::run::{Invocation, LoadGen, LoggedChild};
use super::study::{
    int_domain, parse_iostat, parse_progress, parse_sar_cpu, ratio, read_log, summarize,
    AlignedFrame, RatioSummary, SeriesAligner,
};
use super::sweep::Failure;
use iob_sweep_intf::{Args, Measurement, Operation, ParameterPoint};
use iob_util::*;

const IOSTAT_LOG: &str = "iostat.log";
const SAR_LOG: &str = "sar.log";
const BENCH_LOG: &str = "benchmark.log";
const REPORT: &str = "report.json";

/// Extra monitor samples past the end of the run.
const MONITOR_TRAIL: u64 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorReport {
    pub point: Option<ParameterPoint>,
    pub device: String,
    pub lead: u64,
    pub meas: Measurement,
    pub frame: AlignedFrame,
    pub ratios: BTreeMap<String, RatioSummary>,
}

impl JsonLoad for MonitorReport {}
impl JsonSave for MonitorReport {}

/// The point the monitored run measures, the first value of every axis.
pub fn monitor_point(args: &Args) -> Result<ParameterPoint> {
    let axes = &args.axes;
    axes.verify()?;
    let desc = find_engine(&axes.engines[0])?.desc();
    Ok(ParameterPoint {
        engine: desc.kind.clone(),
        operation: axes.operations[0],
        method: axes.methods[0],
        threads: axes.threads[0],
        queue_depth: match desc.supports_queueing {
            true => axes.queue_depths[0],
            false => desc.repr_qd,
        },
        page_size: axes.page_sizes[0],
        duration: axes.durations[0],
        run_idx: 0,
    })
}

fn nr_monitor_samples(args: &Args, point: &ParameterPoint) -> u64 {
    point.duration + args.lead + MONITOR_TRAIL
}

pub fn iostat_args(args: &Args, point: &ParameterPoint) -> Vec<String> {
    vec![
        "-t".into(),
        "-dx".into(),
        args.monitor_device(),
        "1".into(),
        format!("{}", nr_monitor_samples(args, point)),
    ]
}

pub fn sar_args(args: &Args, point: &ParameterPoint) -> Vec<String> {
    vec![
        "-P".into(),
        "0".into(),
        "1".into(),
        format!("{}", nr_monitor_samples(args, point)),
    ]
}

/// Sums the per-thread progress columns. An index is missing unless every
/// thread has a value for it.
fn sum_threads(frame: &AlignedFrame, key: &str, nr_threads: u32) -> Vec<Option<f64>> {
    (0..frame.index.len())
        .map(|i| {
            let mut sum = 0.0;
            for tid in 0..nr_threads {
                let col = frame.column(&format!("thread{}.{}", tid, key))?;
                sum += col[i]?;
            }
            Some(sum)
        })
        .collect()
}

/// Aligns the load generator's progress output and the two monitor logs
/// onto `0..=duration` and derives how much of the device's traffic the
/// load generator accounts for.
pub fn build_report(
    point: &ParameterPoint,
    device: &str,
    lead: u64,
    bench_out: &str,
    iostat_out: &str,
    sar_out: &str,
) -> Result<MonitorReport> {
    let mut aligner = SeriesAligner::new(int_domain(0, point.duration as i64));
    let shift = -(lead as i64);

    for tid in 0..point.threads {
        for (key, series) in parse_progress(bench_out, &format!("Thread {}", tid)).into_iter() {
            aligner = aligner.add(&format!("thread{}.{}", tid, key), series, 0);
        }
    }
    let dev_cols = parse_iostat(iostat_out, Some(device));
    if dev_cols.is_empty() {
        warn!("monitor: no iostat rows for {:?}", device);
    }
    for (key, series) in dev_cols.into_iter() {
        aligner = aligner.add(&format!("dev.{}", key), series, shift);
    }
    let cpu_cols = parse_sar_cpu(sar_out);
    if cpu_cols.is_empty() {
        warn!("monitor: no sar rows");
    }
    for (key, series) in cpu_cols.into_iter() {
        aligner = aligner.add(&format!("cpu.{}", key), series, shift);
    }

    let mut frame = aligner.align();
    let nr_idx = frame.index.len();
    let bench_iops = sum_threads(&frame, "iops", point.threads);
    let bench_bw = sum_threads(&frame, "bw", point.threads);

    let (ios_col, kbs_col) = match point.operation {
        Operation::Read => ("dev.r/s", "dev.rkB/s"),
        Operation::Write => ("dev.w/s", "dev.wkB/s"),
    };
    let dev_ios = frame
        .column(ios_col)
        .map(|v| v.to_vec())
        .unwrap_or_else(|| vec![None; nr_idx]);
    let dev_mbs: Vec<Option<f64>> = frame
        .column(kbs_col)
        .map(|v| v.iter().map(|x| x.map(|kb| kb / 1024.0)).collect())
        .unwrap_or_else(|| vec![None; nr_idx]);

    let iops_ratio = ratio(&dev_ios, &bench_iops);
    let bw_ratio = ratio(&dev_mbs, &bench_bw);

    let mut ratios = BTreeMap::new();
    ratios.insert("iops".to_string(), summarize(&iops_ratio));
    ratios.insert("bw".to_string(), summarize(&bw_ratio));

    frame.insert("bench.iops", bench_iops)?;
    frame.insert("bench.bw", bench_bw)?;
    frame.insert("ratio.iops", iops_ratio)?;
    frame.insert("ratio.bw", bw_ratio)?;

    Ok(MonitorReport {
        point: Some(point.clone()),
        device: device.to_string(),
        lead,
        meas: Default::default(),
        frame,
        ratios,
    })
}

fn finish_monitors(monitors: Vec<LoggedChild>, timeout: Duration) {
    for mon in monitors.into_iter() {
        if let Err(e) = mon.finish(timeout) {
            warn!("monitor: failed to reap monitor ({:#})", &e);
        }
    }
}

fn spawn_monitors(args: &Args, point: &ParameterPoint, out: &Path) -> Result<Vec<LoggedChild>> {
    let iostat = LoggedChild::spawn(
        &resolve_bin(&args.iostat_bin),
        &iostat_args(args, point),
        out.join(IOSTAT_LOG),
    )?;
    match LoggedChild::spawn(&resolve_bin(&args.sar_bin), &sar_args(args, point), out.join(SAR_LOG)) {
        Ok(sar) => Ok(vec![iostat, sar]),
        Err(e) => {
            finish_monitors(vec![iostat], Duration::from_secs(0));
            Err(e)
        }
    }
}

/// Runs the first point of the sweep once under iostat and sar. The logs
/// and the report are written into `args.out`. `lg` should keep the whole
/// output as the progress lines are needed.
pub fn run_monitor(args: &Args, lg: &mut dyn LoadGen) -> Result<MonitorReport> {
    let point = monitor_point(args)?;
    let engine = find_engine(&point.engine)?;
    let device = args.monitor_device();
    let out = PathBuf::from(&args.out);
    fs::create_dir_all(&out).with_context(|| format!("Creating {:?}", &out))?;

    info!(
        "monitor: {} on {:?}, monitors lead by {}s, logs in {:?}",
        &point, &device, args.lead, &out
    );

    let monitors = spawn_monitors(args, &point, &out)?;

    if !sleep_unless_exiting(Duration::from_secs(args.lead)) {
        finish_monitors(monitors, Duration::from_secs(0));
        return Err(anyhow!(Failure::Interrupted));
    }

    let inv = Invocation {
        program: engine.program(args),
        args: engine.args(&point, args),
        timeout: Duration::from_secs_f64(args.run_timeout(point.duration)),
    };
    let result = lg.invoke(&inv);

    // the monitors outlive the run by the lead plus the trailing samples
    finish_monitors(
        monitors,
        Duration::from_secs(args.lead + MONITOR_TRAIL + 5),
    );

    let bench_out = result?;
    let bench_path = out.join(BENCH_LOG);
    fs::write(&bench_path, &bench_out).with_context(|| format!("Writing {:?}", &bench_path))?;

    let meas = engine.parse(&point, &bench_out);
    if meas.is_empty() {
        bail!("no results in the output of {}, see {:?}", &inv, &bench_path);
    }

    let mut report = build_report(
        &point,
        &device,
        args.lead,
        &bench_out,
        &read_log(out.join(IOSTAT_LOG)),
        &read_log(out.join(SAR_LOG)),
    )?;
    report.meas = meas;

    let report_path = out.join(REPORT);
    report.save(&report_path)?;
    info!("monitor: report saved to {:?}", &report_path);
    Ok(report)
}

pub fn format_report(out: &mut String, report: &MonitorReport) {
    use std::fmt::Write;

    if let Some(point) = report.point.as_ref() {
        writeln!(out, "{}", underline(&format!("Monitored run: {}", point))).unwrap();
    }
    writeln!(
        out,
        "device={} lead={}s IOPS={} BW={}",
        &report.device,
        report.lead,
        format_opt(report.meas.iops, format_count),
        format_opt(report.meas.bw, |v| format!("{:.2}MB/s", v)),
    )
    .unwrap();

    let cols = [
        "bench.iops",
        "ratio.iops",
        "bench.bw",
        "ratio.bw",
        "cpu.%iowait",
        "cpu.%system",
    ];
    write!(out, "\n{:>4}", "t").unwrap();
    for col in cols.iter() {
        write!(out, " {:>12}", col).unwrap();
    }
    writeln!(out).unwrap();
    for (i, idx) in report.frame.index.iter().enumerate() {
        write!(out, "{:>4}", idx).unwrap();
        for col in cols.iter() {
            let v = report.frame.column(col).and_then(|c| c[i]);
            write!(out, " {:>12}", format_opt(v, |v| format!("{:.2}", v))).unwrap();
        }
        writeln!(out).unwrap();
    }

    writeln!(out).unwrap();
    for (key, sum) in report.ratios.iter() {
        writeln!(
            out,
            "{} ratio: mean={} min={} max={} ({} samples)",
            key,
            format_opt(sum.mean, |v| format!("{:.3}", v)),
            format_opt(sum.min, |v| format!("{:.3}", v)),
            format_opt(sum.max, |v| format!("{:.3}", v)),
            sum.nr_valid
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::init_engines;
    use super::*;
    use iob_sweep_intf::AccessMethod;

    const BENCH_OUT: &str = "\
Thread 0: Elapsed Time: 1s, IOPS: 1000, Bandwidth: 4 MB/s
Thread 1: Elapsed Time: 1s, IOPS: 1000, Bandwidth: 4 MB/s
Thread 0: Elapsed Time: 2s, IOPS: 2000, Bandwidth: 8 MB/s
Thread 1: Elapsed Time: 2s, IOPS: 2000, Bandwidth: 8 MB/s
Total I/O Completed: 6000
Total Time: 2 seconds
Throughput: 3000 IOPS
Bandwidth: 12 MB/s
";

    const IOSTAT_OUT: &str = "\
Linux 6.8.0 (host) 	10/19/2026 	_x86_64_	(16 CPU)

10/19/2026 10:00:01 AM
Device            r/s     rkB/s     w/s     wkB/s
nvme0n1          0.00      0.00    0.00      0.00

10/19/2026 10:00:02 AM
Device            r/s     rkB/s     w/s     wkB/s
nvme0n1          0.00      0.00    0.00      0.00

10/19/2026 10:00:03 AM
Device            r/s     rkB/s     w/s     wkB/s
nvme0n1       2000.00   8192.00    0.00      0.00

10/19/2026 10:00:04 AM
Device            r/s     rkB/s     w/s     wkB/s
nvme0n1       4000.00  16384.00    0.00      0.00

10/19/2026 10:00:05 AM
Device            r/s     rkB/s     w/s     wkB/s
nvme0n1       4000.00  16384.00    0.00      0.00
";

    fn point() -> ParameterPoint {
        ParameterPoint {
            engine: "io_uring".into(),
            operation: Operation::Read,
            method: AccessMethod::Rand,
            threads: 2,
            queue_depth: 4,
            page_size: 4096,
            duration: 2,
            run_idx: 0,
        }
    }

    #[test]
    fn test_build_report() {
        let _ = ::env_logger::try_init();
        let report = build_report(&point(), "nvme0n1", 2, BENCH_OUT, IOSTAT_OUT, "").unwrap();
        let frame = &report.frame;
        assert_eq!(frame.index, vec![0.0, 1.0, 2.0]);
        assert_eq!(
            frame.column("bench.iops").unwrap(),
            &[Some(2000.0), Some(2000.0), Some(4000.0)]
        );
        assert_eq!(
            frame.column("dev.r/s").unwrap(),
            &[Some(2000.0), Some(4000.0), Some(4000.0)]
        );
        assert_eq!(
            frame.column("ratio.iops").unwrap(),
            &[Some(1.0), Some(0.5), Some(1.0)]
        );
        assert_eq!(
            frame.column("ratio.bw").unwrap(),
            &[Some(1.0), Some(0.5), Some(1.0)]
        );
        assert_eq!(report.ratios["iops"].nr_valid, 3);
        assert_eq!(report.ratios["iops"].min, Some(0.5));
        assert!(frame.column("cpu.%idle").is_none());
    }

    #[test]
    fn test_build_report_without_logs() {
        let _ = ::env_logger::try_init();
        let report = build_report(&point(), "nvme0n1", 2, "", "", "").unwrap();
        assert_eq!(
            report.frame.column("ratio.iops").unwrap(),
            &[None, None, None]
        );
        assert_eq!(report.ratios["bw"], RatioSummary::default());
    }

    #[test]
    fn test_monitor_point_and_args() {
        let _ = ::env_logger::try_init();
        init_engines();
        let mut args = Args::default();
        args.axes.engines = vec!["sync".into()];
        args.axes.queue_depths = vec![16, 32];
        args.axes.durations = vec![10];
        let point = monitor_point(&args).unwrap();
        assert_eq!(point.queue_depth, 1);
        assert_eq!(point.threads, 1);
        assert_eq!(iostat_args(&args, &point), vec!["-t", "-dx", "nvme0n1", "1", "15"]);
        assert_eq!(sar_args(&args, &point), vec!["-P", "0", "1", "15"]);

        args.axes.engines = vec!["io_uring".into()];
        assert_eq!(monitor_point(&args).unwrap().queue_depth, 16);
    }

    struct CannedGen {}

    impl LoadGen for CannedGen {
        fn invoke(&mut self, _inv: &Invocation) -> Result<String> {
            Ok(BENCH_OUT.to_string())
        }
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_run_monitor() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut args = Args::default();
        args.axes.engines = vec!["io_uring".into()];
        args.axes.threads = vec![2];
        args.axes.durations = vec![2];
        args.lead = 0;
        args.out = dir.path().join("logs").to_string_lossy().to_string();
        args.iostat_bin = "/bin/echo".into();
        args.sar_bin = "/bin/echo".into();

        let report = run_monitor(&args, &mut CannedGen {}).unwrap();
        assert_eq!(report.meas.iops, Some(3000.0));
        assert_eq!(
            report.frame.column("bench.iops").unwrap(),
            &[Some(2000.0), Some(2000.0), Some(4000.0)]
        );

        let logs = dir.path().join("logs");
        assert_eq!(
            fs::read_to_string(logs.join(IOSTAT_LOG)).unwrap(),
            "-t -dx nvme0n1 1 5\n"
        );
        assert!(logs.join(BENCH_LOG).exists());
        let saved = MonitorReport::load(logs.join(REPORT)).unwrap();
        assert_eq!(saved.meas.iops, Some(3000.0));

        let mut buf = String::new();
        format_report(&mut buf, &report);
        assert!(buf.contains("ratio.iops"));
    }
}
