// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{error, info};
use std::path::Path;
use std::process::exit;

use iob_sweep_intf::{Args, Mode};
use iob_util::*;

mod engine;
mod format;
mod monitor;
mod parse;
mod progress;
mod run;
mod store;
mod study;
mod sweep;

use run::RunCtx;
use store::ResultStore;
use sweep::Sweep;

fn open_existing_store(path: &str) -> Result<ResultStore> {
    if !Path::new(path).exists() {
        bail!("result ledger {:?} doesn't exist", path);
    }
    ResultStore::open(path)
}

fn run_sweep(args: &Args) -> Result<()> {
    let mut store = ResultStore::open(&args.result)?;
    let mut rctx = RunCtx::new(args.tail, args.reset_cmd.as_deref());
    let stats = Sweep::new(args).run(&mut store, &mut rctx)?;

    println!(
        "Sweep finished: {} of {} runs measured, {} already recorded, {} filled from stored values, {} failed, {} rows written to {:?}{}",
        stats.measured,
        stats.planned,
        stats.skipped,
        stats.backfilled,
        stats.failed,
        stats.rows_written,
        store.path(),
        if stats.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

fn run_monitor(args: &Args) -> Result<()> {
    // progress lines are spread over the whole output
    let mut rctx = RunCtx::new(0, None);
    let report = monitor::run_monitor(args, &mut rctx)?;
    let mut buf = String::new();
    monitor::format_report(&mut buf, &report);
    print!("{}", &buf);
    Ok(())
}

fn run_compare(args: &Args) -> Result<()> {
    study::compare::check_engines(&args.baseline, &args.variant)?;
    let store = open_existing_store(&args.result)?;
    let cmps =
        study::compare_engines(store.records(), &args.baseline, &args.variant, args.metric);
    if cmps.is_empty() {
        bail!(
            "no {:?} or {:?} results in {:?}",
            &args.baseline,
            &args.variant,
            &args.result
        );
    }
    info!("study: {} groups compared", cmps.len());

    let mut buf = String::new();
    study::compare::format_comparisons(
        &mut buf,
        &cmps,
        &args.baseline,
        &args.variant,
        args.metric,
    );
    print!("{}", &buf);
    Ok(())
}

fn run_format(args: &Args) -> Result<()> {
    let store = open_existing_store(&args.result)?;
    let mut buf = String::new();
    format::format_records(&mut buf, store.records());
    if store.nr_bad_lines() > 0 {
        buf += &format!("{} unparseable line(s) skipped\n", store.nr_bad_lines());
    }
    print!("{}", &buf);
    Ok(())
}

fn main() {
    setup_prog_state();
    engine::init_engines();

    let (args_file, updated) = Args::init_args_and_logging_nosave().unwrap_or_else(|e| {
        error!("Failed to process args ({:#})", &e);
        exit(1);
    });

    if updated {
        if let Err(e) = Args::save_args(&args_file) {
            error!("Failed to update args file ({:#})", &e);
            exit(1);
        }
    }

    let args = &args_file.data;

    let result = match args.mode {
        Mode::Run => run_sweep(args),
        Mode::Monitor => run_monitor(args),
        Mode::Compare => run_compare(args),
        Mode::Format => run_format(args),
    };

    if let Err(e) = result {
        error!("{:?} failed ({:#})", args.mode, &e);
        exit(1);
    }
}
