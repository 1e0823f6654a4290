// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use crossbeam::channel::Sender;
use log::{info, warn};
use simplelog as sl;
use std::env;
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

pub mod json_file;

pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonSave};

pub const USEC: f64 = 1.0 / 1_000_000.0;

const SIZE_UNITS: &[(f64, f64, &str)] = &[
    (1024.0, 1024.0, "K"),
    (1048576.0, 1024.0, "M"),
    (1073741824.0, 1024.0, "G"),
    (1099511627776.0, 1024.0, "T"),
    (1125899906842624.0, 1024.0, "P"),
    (1152921504606846976.0, 1024.0, "E"),
];

const COUNT_UNITS: &[(f64, f64, &str)] = &[
    (1e3, 1000.0, "k"),
    (1e6, 1000.0, "m"),
    (1e9, 1000.0, "g"),
    (1e12, 1000.0, "t"),
    (1e15, 1000.0, "p"),
];

// in nsecs
const DURATION_UNITS: &[(f64, f64, &str)] = &[
    (1.0, 1000.0, "n"),
    (1e3, 1000.0, "u"),
    (1e6, 1000.0, "m"),
    (1e9, 60.0, "s"),
    (60e9, 60.0, "M"),
    (3600e9, 24.0, "H"),
    (86400e9, 365.0, "D"),
    (31536000e9, 1000.0, "Y"),
];

pub fn underline(content: &str) -> String {
    let indent = content.chars().take_while(|c| *c == ' ').count();
    let width = content.chars().count() - indent;
    format!("{}\n{}{}\n", content, " ".repeat(indent), "-".repeat(width))
}

/// `(unit, limit, suffix)` are tried in order until `val / unit` stays
/// under `limit`. One decimal is shown below 100.
fn format_scaled(val: f64, units: &[(f64, f64, &str)]) -> String {
    for (unit, limit, suffix) in units.iter() {
        let scaled = val / unit;
        if scaled < 99.95 {
            return format!("{:.1}{}", scaled.max(0.1), suffix);
        }
        if scaled < *limit {
            return format!("{:.0}{}", scaled, suffix);
        }
    }
    "INF".into()
}

pub fn format_size<T: num::ToPrimitive>(size: T) -> String {
    match size.to_u64().unwrap_or(0) {
        0 => "0".into(),
        v if v < 9999 => v.to_string(),
        v => format_scaled(v as f64, SIZE_UNITS),
    }
}

pub fn format_count<T: num::ToPrimitive>(count: T) -> String {
    match count.to_u64().unwrap_or(0) {
        0 => "0".into(),
        v if v < 1000 => v.to_string(),
        v => format_scaled(v as f64, COUNT_UNITS),
    }
}

/// `dur` is in seconds.
pub fn format_duration(dur: f64) -> String {
    let nsecs = (dur * 1e9).round();
    if nsecs <= 0.0 {
        return "0".into();
    }
    format_scaled(nsecs, DURATION_UNITS)
}

/// Formats an optional value, "-" when missing.
pub fn format_opt<T, F>(v: Option<T>, fmt: F) -> String
where
    F: Fn(T) -> String,
{
    match v {
        Some(v) => fmt(v),
        None => "-".into(),
    }
}

/// Walks "<num><unit>" terms such as "1M_30s" calling `term` for each. A
/// trailing number without a unit is passed with `None`. Underscores are
/// ignored.
fn for_each_term<K, U, F>(input: &str, unit_of: U, mut term: F) -> Result<()>
where
    U: Fn(char) -> Option<K>,
    F: FnMut(&str, Option<K>) -> Result<()>,
{
    let mut num = String::new();
    for ch in input.chars().filter(|c| *c != '_') {
        match unit_of(ch) {
            Some(unit) => {
                term(num.trim(), Some(unit))?;
                num.clear();
            }
            None => num.push(ch),
        }
    }
    if !num.trim().is_empty() {
        term(num.trim(), None)?;
    }
    Ok(())
}

/// Parses a duration into seconds, e.g. "300m", "1M_30s" or "1.5".
pub fn parse_duration(input: &str) -> Result<f64> {
    let unit_of = |ch: char| match ch {
        'n' => Some(1e-9),
        'u' => Some(1e-6),
        'm' => Some(1e-3),
        's' => Some(1.0),
        'M' => Some(60.0),
        'H' => Some(3600.0),
        'D' => Some(86400.0),
        'Y' => Some(31536000.0),
        _ => None,
    };
    let mut secs = 0.0;
    for_each_term(input, unit_of, |num, mult| {
        secs += num.parse::<f64>()? * mult.unwrap_or(1.0);
        Ok(())
    })?;
    Ok(secs)
}

/// Parses a size in bytes with optional binary suffixes, e.g. "4k" or "1.5M".
pub fn parse_size(input: &str) -> Result<u64> {
    let unit_of = |ch: char| match ch.to_ascii_uppercase() {
        'B' => Some(0),
        'K' => Some(10),
        'M' => Some(20),
        'G' => Some(30),
        'T' => Some(40),
        'P' => Some(50),
        'E' => Some(60),
        _ => None,
    };
    let mut bytes = 0;
    for_each_term(input, unit_of, |num, shift| {
        let shift: u32 = shift.unwrap_or(0);
        bytes += if num.contains('.') {
            (num.parse::<f64>()? * (1u64 << shift) as f64).round() as u64
        } else {
            num.parse::<u64>()? << shift
        };
        Ok(())
    })?;
    Ok(bytes)
}

/// Parses a comma separated list with `parse_one` applied to each element.
/// Empty elements are skipped.
pub fn parse_list_with<T, F>(input: &str, mut parse_one: F) -> Result<Vec<T>>
where
    F: FnMut(&str) -> Result<T>,
{
    let mut list = vec![];
    for tok in input.split(',').map(|x| x.trim()).filter(|x| x.len() > 0) {
        list.push(parse_one(tok).with_context(|| format!("Parsing list element {:?}", tok))?);
    }
    Ok(list)
}

pub fn parse_list<T>(input: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    parse_list_with(input, |tok| Ok(tok.parse::<T>()?))
}

fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(md) => md.is_file() && md.mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Resolves `prog` to an executable path. Anything with a slash is taken
/// as is. Bare names are looked up next to our own binary and then in PATH.
/// Unresolvable names are returned unchanged.
pub fn resolve_bin(prog: &str) -> String {
    if prog.contains('/') {
        return prog.to_string();
    }

    let mut dirs: Vec<PathBuf> = vec![];
    if let Some(dir) = env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        dirs.push(dir);
    }
    if let Some(path) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&path));
    }

    dirs.iter()
        .map(|dir| dir.join(prog))
        .find(|path| is_executable(path))
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| prog.to_string())
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|x| x.as_secs()).unwrap_or(0)
}

pub fn format_unix_time(time: u64) -> String {
    DateTime::<Local>::from(UNIX_EPOCH + Duration::from_secs(time))
        .format("%x %T")
        .to_string()
}

/// RUST_LOG hands control to env_logger. Otherwise log to the terminal, or
/// plain stderr when it isn't one, at a level picked by `verbosity`.
pub fn init_logging(verbosity: u32) {
    if env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let level = match verbosity {
        0 | 1 => sl::LevelFilter::Info,
        2 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    };
    let cfg = sl::ConfigBuilder::new()
        .set_time_level(sl::LevelFilter::Off)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off)
        .build();

    let on_term = console::user_attended_stderr()
        && sl::TermLogger::init(
            level,
            cfg.clone(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        )
        .is_ok();
    if !on_term {
        let _ = sl::SimpleLogger::init(level, cfg);
    }
}

/// Forwards `reader` line by line to `tx` until EOF or until the receiving
/// end goes away. Used to merge a child's stdout and stderr.
pub fn child_reader_thread<R: Read>(name: String, reader: R, tx: Sender<String>) {
    for line in BufReader::new(reader).lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: Failed to read child output ({:?})", &name, &e);
                return;
            }
        };
        if tx.send(line).is_err() {
            info!("{}: Nobody is listening, reader thread terminating", &name);
            return;
        }
    }
}

/// Runs `cmd` to completion. Failing to start and non-zero exit are errors
/// described with `emsg`.
pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{:?} ({}): {}", &cmd, &rc, emsg),
        Err(e) => bail!("{:?} ({}): {}", &cmd, &e, emsg),
    }
}

lazy_static::lazy_static! {
    static ref PROG_EXITING: Mutex<bool> = Mutex::new(false);
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() {
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    }) {
        warn!("Failed to set term handler ({})", &e);
    }
}

pub fn set_prog_exiting() {
    *PROG_EXITING.lock().unwrap() = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    *PROG_EXITING.lock().unwrap()
}

/// Sleeps for `dur` unless the program starts exiting. Returns false if
/// the sleep was cut short by exit.
pub fn sleep_unless_exiting(dur: Duration) -> bool {
    let until = Instant::now() + dur;
    let mut exiting = PROG_EXITING.lock().unwrap();
    loop {
        if *exiting {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        exiting = PROG_WAITQ.wait_timeout(exiting, until - now).unwrap().0;
    }
}
