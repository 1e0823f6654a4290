// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::engine::{find_engine, Engine};
use super::progress::SweepProgress;
use super::run::{Invocation, LoadGen};
use super::store::ResultStore;
use iob_sweep_intf::{Args, Completeness, Field, Measurement, ParameterPoint, ResultRecord, SweepAxes};
use iob_util::*;

fn format_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.name())
        .collect::<Vec<&str>>()
        .join(",")
}

/// Why one attempt at a point failed.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("{0:#}")]
    Launch(anyhow::Error),
    #[error("incomplete output, missing {}", format_fields(.0))]
    Incomplete(Vec<Field>),
    #[error("interrupted")]
    Interrupted,
}

#[derive(Error, Debug)]
#[error("gave up after {attempts} attempt(s), last failure: {last}")]
pub struct Exhausted {
    pub attempts: u32,
    pub last: Failure,
}

/// Calls `action` with the attempt index until it succeeds, up to
/// `max_attempts` times. Interruption ends the attempts immediately.
pub fn attempt<T, F>(max_attempts: u32, mut action: F) -> std::result::Result<T, Exhausted>
where
    F: FnMut(u32) -> std::result::Result<T, Failure>,
{
    let max_attempts = max_attempts.max(1);
    let mut idx = 0;
    loop {
        let failure = match action(idx) {
            Ok(v) => return Ok(v),
            Err(f) => f,
        };
        idx += 1;
        if let Failure::Interrupted = failure {
            return Err(Exhausted {
                attempts: idx,
                last: failure,
            });
        }
        if idx >= max_attempts {
            return Err(Exhausted {
                attempts: idx,
                last: failure,
            });
        }
        warn!(
            "sweep: attempt {}/{} failed ({}), retrying",
            idx, max_attempts, &failure
        );
    }
}

/// One load generator run and the nominal queue depths its measurement is
/// persisted under. For engines without queueing the point is at the
/// representative depth and the measurement is broadcast to every depth in
/// the queue depth domain.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRun {
    pub point: ParameterPoint,
    pub row_qds: Vec<u32>,
    pub broadcast: bool,
}

/// Expands `axes` into the ordered list of runs. Fails on unknown engines.
pub fn plan(axes: &SweepAxes) -> Result<Vec<PlannedRun>> {
    axes.verify()?;

    let mut qd_domain = vec![];
    for qd in axes.queue_depths.iter() {
        if !qd_domain.contains(qd) {
            qd_domain.push(*qd);
        }
    }

    let mut descs = vec![];
    for kind in axes.engines.iter() {
        descs.push(find_engine(kind)?.desc());
    }

    let mut runs = vec![];
    for desc in descs.iter() {
        for operation in axes.operations.iter() {
            for method in axes.methods.iter() {
                for threads in axes.threads.iter() {
                    let qds: Vec<(u32, Vec<u32>, bool)> = if desc.supports_queueing {
                        qd_domain.iter().map(|qd| (*qd, vec![*qd], false)).collect()
                    } else {
                        vec![(desc.repr_qd, qd_domain.clone(), true)]
                    };
                    for (queue_depth, row_qds, broadcast) in qds.into_iter() {
                        for page_size in axes.page_sizes.iter() {
                            for run_idx in 0..axes.nr_runs {
                                for duration in axes.durations.iter() {
                                    runs.push(PlannedRun {
                                        point: ParameterPoint {
                                            engine: desc.kind.clone(),
                                            operation: *operation,
                                            method: *method,
                                            threads: *threads,
                                            queue_depth,
                                            page_size: *page_size,
                                            duration: *duration,
                                            run_idx,
                                        },
                                        row_qds: row_qds.clone(),
                                        broadcast,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(runs)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepStats {
    pub planned: usize,
    pub skipped: usize,
    pub backfilled: usize,
    pub measured: usize,
    pub failed: usize,
    pub rows_written: usize,
    pub interrupted: bool,
}

impl fmt::Display for SweepStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "planned={} skipped={} backfilled={} measured={} failed={} rows_written={}{}",
            self.planned,
            self.skipped,
            self.backfilled,
            self.measured,
            self.failed,
            self.rows_written,
            if self.interrupted { " (interrupted)" } else { "" }
        )
    }
}

pub struct Sweep<'a> {
    args: &'a Args,
    completeness: Completeness,
    max_attempts: u32,
    reset_between_attempts: bool,
}

impl<'a> Sweep<'a> {
    pub fn new(args: &'a Args) -> Self {
        Self {
            args,
            completeness: args.require.clone(),
            max_attempts: args.attempts.max(1),
            reset_between_attempts: args.reset_between_attempts,
        }
    }

    fn measure_once(
        &self,
        engine: &dyn Engine,
        point: &ParameterPoint,
        lg: &mut dyn LoadGen,
        attempt_idx: u32,
    ) -> std::result::Result<Measurement, Failure> {
        if attempt_idx > 0 && self.reset_between_attempts {
            if let Err(e) = lg.reset() {
                warn!("sweep: device reset failed, continuing ({:#})", &e);
            }
        }

        let inv = Invocation {
            program: engine.program(self.args),
            args: engine.args(point, self.args),
            timeout: Duration::from_secs_f64(self.args.run_timeout(point.duration)),
        };

        let output = lg.invoke(&inv).map_err(|e| match e.downcast::<Failure>() {
            Ok(f) => f,
            Err(e) => Failure::Launch(e),
        })?;

        let meas = engine.parse(point, &output);
        let missing = self.completeness.missing(&meas);
        if missing.is_empty() {
            Ok(meas)
        } else {
            debug!("sweep: unparsed output of {}\n{}", point, &output);
            Err(Failure::Incomplete(missing))
        }
    }

    /// Runs every planned point which isn't fully in `store` yet. Failed
    /// points are logged and skipped. Only store and configuration errors
    /// are returned.
    pub fn run(&self, store: &mut ResultStore, lg: &mut dyn LoadGen) -> Result<SweepStats> {
        let runs = plan(&self.args.axes)?;
        let mut stats = SweepStats {
            planned: runs.len(),
            ..Default::default()
        };
        let mut progress = SweepProgress::new(runs.len() as u64);

        info!(
            "sweep: {} runs planned for {} grid points, requiring {} with up to {} attempts",
            runs.len(),
            self.args.axes.nr_points(),
            &self.completeness,
            self.max_attempts
        );

        for (idx, run) in runs.iter().enumerate() {
            if prog_exiting() {
                stats.interrupted = true;
                break;
            }

            let missing_qds: Vec<u32> = run
                .row_qds
                .iter()
                .filter(|qd| !store.exists(&run.point.with_queue_depth(**qd)))
                .cloned()
                .collect();
            if missing_qds.is_empty() {
                debug!("sweep: {} already recorded, skipping", &run.point);
                stats.skipped += 1;
                progress.advance();
                continue;
            }

            // Part of a broadcast group is already there, fill in the
            // new depths from the stored measurement.
            if run.broadcast && missing_qds.len() < run.row_qds.len() {
                let stored = run
                    .row_qds
                    .iter()
                    .filter_map(|qd| store.get(&run.point.with_queue_depth(*qd)))
                    .next()
                    .cloned();
                if let Some(stored) = stored {
                    let recs: Vec<ResultRecord> =
                        missing_qds.iter().map(|qd| stored.broadcast_to(*qd)).collect();
                    info!(
                        "sweep: {} broadcasting stored values to qd={:?}",
                        &run.point, &missing_qds
                    );
                    stats.rows_written += recs.len();
                    store.append_broadcast(recs)?;
                    stats.backfilled += 1;
                    progress.advance();
                    continue;
                }
            }

            progress.set_status(&format!("[{}/{}] {}", idx + 1, runs.len(), &run.point));
            let engine = find_engine(&run.point.engine)?;

            let result = attempt(self.max_attempts, |attempt_idx| {
                self.measure_once(&**engine, &run.point, &mut *lg, attempt_idx)
            });

            match result {
                Ok(meas) => {
                    let rec = ResultRecord::new(run.point.clone(), meas, unix_now());
                    if run.broadcast {
                        let recs: Vec<ResultRecord> =
                            missing_qds.iter().map(|qd| rec.broadcast_to(*qd)).collect();
                        stats.rows_written += recs.len();
                        store.append_broadcast(recs)?;
                    } else {
                        store.append(rec)?;
                        stats.rows_written += 1;
                    }
                    stats.measured += 1;
                }
                Err(Exhausted {
                    last: Failure::Interrupted,
                    ..
                }) => {
                    warn!("sweep: {} interrupted, nothing recorded", &run.point);
                    stats.interrupted = true;
                    break;
                }
                Err(e) => {
                    error!("sweep: {} {}", &run.point, &e);
                    stats.failed += 1;
                }
            }
            progress.advance();
        }

        info!("sweep: {}", &stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::init_engines;
    use super::*;
    use anyhow::bail;
    use iob_sweep_intf::{AccessMethod, Operation};
    use std::collections::VecDeque;

    const GOOD_OUTPUT: &str = "\
Total I/O Completed: 120000
Total Time: 10 seconds
Throughput: 1.2e+04 IOPS
Bandwidth: 46.875 MB/s
";

    const GOOD_OUTPUT_FAST: &str = "\
Total I/O Completed: 240000
Total Time: 10 seconds
Throughput: 2.4e+04 IOPS
Bandwidth: 93.75 MB/s
";

    #[derive(Default)]
    struct FakeGen {
        script: VecDeque<std::result::Result<String, String>>,
        fallback: Option<String>,
        invocations: Vec<Invocation>,
        resets: u32,
    }

    impl FakeGen {
        fn always(output: &str) -> Self {
            Self {
                fallback: Some(output.to_string()),
                ..Default::default()
            }
        }
    }

    impl LoadGen for FakeGen {
        fn invoke(&mut self, inv: &Invocation) -> Result<String> {
            self.invocations.push(inv.clone());
            match self.script.pop_front() {
                Some(Ok(v)) => Ok(v),
                Some(Err(e)) => bail!("{}", e),
                None => match self.fallback.as_ref() {
                    Some(v) => Ok(v.clone()),
                    None => bail!("exit status: 1"),
                },
            }
        }

        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
    }

    struct InterruptingGen {
        calls: u32,
    }

    impl LoadGen for InterruptingGen {
        fn invoke(&mut self, _inv: &Invocation) -> Result<String> {
            self.calls += 1;
            Err(Failure::Interrupted.into())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn test_args(engines: &[&str], qds: &[u32]) -> Args {
        let mut args = Args::default();
        args.axes = SweepAxes {
            engines: engines.iter().map(|x| x.to_string()).collect(),
            operations: vec![Operation::Read],
            methods: vec![AccessMethod::Rand],
            threads: vec![1, 4],
            queue_depths: qds.to_vec(),
            page_sizes: vec![4096],
            nr_runs: 1,
            durations: vec![10],
        };
        args
    }

    fn open_store(dir: &tempfile::TempDir) -> ResultStore {
        ResultStore::open(dir.path().join("ledger.jsonl")).unwrap()
    }

    #[test]
    fn test_attempt() {
        let _ = ::env_logger::try_init();
        let mut calls = vec![];
        let res = attempt(3, |idx| {
            calls.push(idx);
            if idx < 2 {
                Err(Failure::Incomplete(vec![Field::Iops]))
            } else {
                Ok(idx)
            }
        });
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls, vec![0, 1, 2]);

        let res: std::result::Result<(), _> =
            attempt(3, |_| Err(Failure::Incomplete(vec![Field::Bw])));
        let e = res.unwrap_err();
        assert_eq!(e.attempts, 3);
        assert!(e.to_string().contains("missing bw"));

        let mut nr_calls = 0;
        let res: std::result::Result<(), _> = attempt(3, |_| {
            nr_calls += 1;
            Err(Failure::Interrupted)
        });
        assert_eq!(nr_calls, 1);
        assert!(matches!(res.unwrap_err().last, Failure::Interrupted));

        let res: std::result::Result<(), _> = attempt(0, |_| Err(Failure::Interrupted));
        assert_eq!(res.unwrap_err().attempts, 1);
    }

    #[test]
    fn test_plan_order_and_collapse() {
        let _ = ::env_logger::try_init();
        init_engines();
        let mut args = test_args(&["sync", "io_uring"], &[1, 2, 8, 16]);
        args.axes.nr_runs = 2;
        let runs = plan(&args.axes).unwrap();

        // sync: 2 threads x 2 runs, io_uring: 2 threads x 4 qds x 2 runs
        assert_eq!(runs.len(), 4 + 16);
        assert!(runs[..4].iter().all(|r| r.broadcast && r.point.queue_depth == 1));
        assert_eq!(runs[0].row_qds, vec![1, 2, 8, 16]);
        assert_eq!(runs[0].point.run_idx, 0);
        assert_eq!(runs[1].point.run_idx, 1);
        assert_eq!(runs[2].point.threads, 4);

        let uring: Vec<&PlannedRun> = runs[4..].iter().collect();
        assert!(uring.iter().all(|r| !r.broadcast && r.row_qds == vec![r.point.queue_depth]));
        assert_eq!(
            uring.iter().take(4).map(|r| (r.point.queue_depth, r.point.run_idx)).collect::<Vec<_>>(),
            vec![(1, 0), (1, 1), (2, 0), (2, 1)]
        );

        args.axes.engines = vec!["spdk".into()];
        assert!(plan(&args.axes).is_err());
    }

    #[test]
    fn test_broadcast_rows() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let args = test_args(&["sync"], &[1, 2, 8, 16]);
        let mut lg = FakeGen::always(GOOD_OUTPUT);

        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.invocations.len(), 2);
        assert_eq!(stats.measured, 2);
        assert_eq!(stats.rows_written, 8);
        assert!(lg.invocations[0].args.contains(&"--sync".to_string()));

        for threads in [1, 4].iter() {
            let rows: Vec<&ResultRecord> = store
                .records()
                .iter()
                .filter(|r| r.point.threads == *threads)
                .collect();
            assert_eq!(rows.len(), 4);
            assert!(rows.iter().all(|r| r.meas == rows[0].meas && r.measured_qd == 1));
            assert_eq!(rows.iter().filter(|r| r.is_broadcast()).count(), 3);
            assert_eq!(rows[0].meas.iops, Some(12000.0));
        }
    }

    #[test]
    fn test_resume_and_extend() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut args = test_args(&["sync", "io_uring"], &[1, 2]);

        {
            let mut store = open_store(&dir);
            let mut lg = FakeGen::always(GOOD_OUTPUT);
            let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
            assert_eq!(lg.invocations.len(), 2 + 4);
            assert_eq!(stats.rows_written, 4 + 4);
        }

        // Everything is recorded, nothing should run.
        {
            let mut store = open_store(&dir);
            let mut lg = FakeGen::always(GOOD_OUTPUT);
            let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
            assert_eq!(lg.invocations.len(), 0);
            assert_eq!(stats.skipped, stats.planned);
        }

        // A new queue depth needs new io_uring runs. The sync rows for it
        // are copied from the stored measurement without running anything.
        args.axes.queue_depths = vec![1, 2, 4];
        let mut store = open_store(&dir);
        let mut lg = FakeGen::always(GOOD_OUTPUT_FAST);
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.invocations.len(), 2);
        assert!(lg
            .invocations
            .iter()
            .all(|inv| !inv.args.contains(&"--sync".to_string())));
        assert_eq!(stats.backfilled, 2);
        assert_eq!(stats.measured, 2);
        assert_eq!(stats.rows_written, 2 + 2);
        assert_eq!(store.records().len(), 12);

        for threads in [1, 4].iter() {
            let sync: Vec<&ResultRecord> = store
                .records()
                .iter()
                .filter(|r| r.point.engine == "sync" && r.point.threads == *threads)
                .collect();
            assert_eq!(sync.len(), 3);
            assert!(sync
                .iter()
                .all(|r| r.meas == sync[0].meas && r.measured_qd == 1));
            assert_eq!(sync[0].meas.iops, Some(12000.0));
        }
        let uring_qd4 = store
            .records()
            .iter()
            .filter(|r| r.point.engine == "io_uring" && r.point.queue_depth == 4)
            .count();
        assert_eq!(uring_qd4, 2);
    }

    #[test]
    fn test_retry_bound() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let mut args = test_args(&["io_uring"], &[4]);
        args.axes.threads = vec![1];
        args.reset_between_attempts = true;

        let mut lg = FakeGen::default();
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.invocations.len(), 3);
        assert_eq!(lg.resets, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.records().len(), 0);

        // Garbage output counts as a failed attempt too.
        let mut lg = FakeGen::always("Segmentation fault");
        args.reset_between_attempts = false;
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.invocations.len(), 3);
        assert_eq!(lg.resets, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.records().len(), 0);
    }

    #[test]
    fn test_retry_then_success() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let mut args = test_args(&["io_uring"], &[4]);
        args.axes.threads = vec![1];

        let mut lg = FakeGen::always(GOOD_OUTPUT);
        lg.script.push_back(Err("exit status: 1".into()));
        lg.script.push_back(Ok("Throughput: 100 IOPS\n".into()));
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.invocations.len(), 3);
        assert_eq!(stats.measured, 1);
        assert_eq!(store.records()[0].meas.iops, Some(12000.0));
    }

    #[test]
    fn test_full_completeness() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let mut args = test_args(&["io_uring"], &[4]);
        args.axes.threads = vec![1];
        args.require = Completeness::full();

        let mut lg = FakeGen::always(GOOD_OUTPUT);
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(lg.invocations.len(), 3);
    }

    #[test]
    fn test_interrupted() {
        let _ = ::env_logger::try_init();
        init_engines();
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let args = test_args(&["io_uring"], &[1, 2]);

        let mut lg = InterruptingGen { calls: 0 };
        let stats = Sweep::new(&args).run(&mut store, &mut lg).unwrap();
        assert_eq!(lg.calls, 1);
        assert!(stats.interrupted);
        assert_eq!(store.records().len(), 0);
    }
}
