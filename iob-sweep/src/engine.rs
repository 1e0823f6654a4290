// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::debug;
use std::sync::{Arc, Mutex};

use super::parse::{parse_fio_json, parse_text};
use iob_sweep_intf::{AccessMethod, Args, Measurement, Operation, ParameterPoint};
use iob_util::*;

lazy_static::lazy_static! {
    static ref ENGINES: Mutex<Vec<Arc<Box<dyn Engine>>>> = Mutex::new(vec![]);
}

pub fn find_engine(kind: &str) -> Result<Arc<Box<dyn Engine>>> {
    for engine in ENGINES.lock().unwrap().iter() {
        if engine.desc().kind == kind {
            return Ok(engine.clone());
        }
    }
    bail!("unknown engine {:?}", kind);
}

/// Capabilities of an engine which the sweep planner needs to know about.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineDesc {
    pub kind: String,
    pub supports_queueing: bool,
    /// Queue depth to measure at when queueing isn't supported.
    pub repr_qd: u32,
}

impl EngineDesc {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.into(),
            supports_queueing: true,
            repr_qd: 1,
        }
    }

    pub fn no_queueing(mut self) -> Self {
        self.supports_queueing = false;
        self
    }
}

pub trait Engine: Send + Sync {
    fn desc(&self) -> EngineDesc;
    fn program(&self, args: &Args) -> String;
    fn args(&self, point: &ParameterPoint, args: &Args) -> Vec<String>;
    fn parse(&self, point: &ParameterPoint, output: &str) -> Measurement;
}

/// The native load generator. `sync` issues one I/O at a time per thread,
/// `io_uring` keeps up to queue depth I/Os in flight.
pub struct NativeEngine {
    kind: &'static str,
    sync: bool,
}

impl Engine for NativeEngine {
    fn desc(&self) -> EngineDesc {
        let desc = EngineDesc::new(self.kind);
        if self.sync {
            desc.no_queueing()
        } else {
            desc
        }
    }

    fn program(&self, args: &Args) -> String {
        resolve_bin(&args.bench_bin)
    }

    fn args(&self, point: &ParameterPoint, args: &Args) -> Vec<String> {
        let mut cargs = vec![
            format!("--location={}", &args.location),
            if self.sync { "--sync" } else { "--async" }.to_string(),
            format!("--threads={}", point.threads),
        ];
        if !self.sync {
            cargs.push(format!("--queue_depth={}", point.queue_depth));
        }
        cargs.extend(vec![
            format!("--method={}", point.method),
            format!("--type={}", point.operation),
            format!("--page_size={}", point.page_size),
            "--time".to_string(),
            format!("--duration={}", point.duration),
            "-y".to_string(),
        ]);
        cargs
    }

    fn parse(&self, _point: &ParameterPoint, output: &str) -> Measurement {
        parse_text(output)
    }
}

pub struct FioEngine {}

impl FioEngine {
    fn rw(point: &ParameterPoint) -> &'static str {
        match (point.operation, point.method) {
            (Operation::Read, AccessMethod::Seq) => "read",
            (Operation::Read, AccessMethod::Rand) => "randread",
            (Operation::Write, AccessMethod::Seq) => "write",
            (Operation::Write, AccessMethod::Rand) => "randwrite",
        }
    }
}

impl Engine for FioEngine {
    fn desc(&self) -> EngineDesc {
        EngineDesc::new("fio")
    }

    fn program(&self, args: &Args) -> String {
        resolve_bin(&args.fio_bin)
    }

    fn args(&self, point: &ParameterPoint, args: &Args) -> Vec<String> {
        vec![
            "--name=iob".to_string(),
            format!("--filename={}", &args.location),
            format!("--rw={}", Self::rw(point)),
            format!("--bs={}", point.page_size),
            "--ioengine=io_uring".to_string(),
            format!("--iodepth={}", point.queue_depth),
            format!("--numjobs={}", point.threads),
            format!("--runtime={}", point.duration),
            "--time_based".to_string(),
            "--group_reporting".to_string(),
            "--output-format=json".to_string(),
        ]
    }

    fn parse(&self, point: &ParameterPoint, output: &str) -> Measurement {
        parse_fio_json(output, point.operation)
    }
}

/// Registers the built-in engines. Safe to call more than once.
pub fn init_engines() -> () {
    let mut engines = ENGINES.lock().unwrap();
    if !engines.is_empty() {
        return;
    }

    let builtin: Vec<Box<dyn Engine>> = vec![
        Box::new(NativeEngine {
            kind: "sync",
            sync: true,
        }),
        Box::new(NativeEngine {
            kind: "io_uring",
            sync: false,
        }),
        Box::new(FioEngine {}),
    ];
    for engine in builtin.into_iter() {
        engines.push(Arc::new(engine));
    }
    debug!(
        "engine: registered {:?}",
        engines.iter().map(|e| e.desc().kind).collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(engine: &str) -> ParameterPoint {
        ParameterPoint {
            engine: engine.into(),
            operation: Operation::Write,
            method: AccessMethod::Rand,
            threads: 2,
            queue_depth: 16,
            page_size: 4096,
            duration: 10,
            run_idx: 0,
        }
    }

    #[test]
    fn test_registry() {
        let _ = ::env_logger::try_init();
        init_engines();
        init_engines();
        assert!(!find_engine("sync").unwrap().desc().supports_queueing);
        assert!(find_engine("io_uring").unwrap().desc().supports_queueing);
        assert_eq!(find_engine("fio").unwrap().desc().repr_qd, 1);
        assert!(find_engine("spdk").is_err());
        assert_eq!(ENGINES.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_native_args() {
        let _ = ::env_logger::try_init();
        let args = Args::default();
        let sync = NativeEngine {
            kind: "sync",
            sync: true,
        };
        let cargs = sync.args(&point("sync"), &args);
        assert!(cargs.contains(&"--sync".to_string()));
        assert!(!cargs.iter().any(|a| a.starts_with("--queue_depth")));
        assert!(cargs.contains(&"--type=write".to_string()));
        assert!(cargs.contains(&"--method=rand".to_string()));
        assert_eq!(cargs.last().unwrap(), "-y");

        let uring = NativeEngine {
            kind: "io_uring",
            sync: false,
        };
        let cargs = uring.args(&point("io_uring"), &args);
        assert!(cargs.contains(&"--async".to_string()));
        assert!(cargs.contains(&"--queue_depth=16".to_string()));
    }

    #[test]
    fn test_fio_args() {
        let _ = ::env_logger::try_init();
        let cargs = FioEngine {}.args(&point("fio"), &Args::default());
        assert!(cargs.contains(&"--rw=randwrite".to_string()));
        assert!(cargs.contains(&"--iodepth=16".to_string()));
        assert!(cargs.contains(&"--numjobs=2".to_string()));
        assert!(cargs.contains(&"--output-format=json".to_string()));
    }
}
