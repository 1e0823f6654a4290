// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::{AccessMethod, Completeness, Field, Operation, SweepAxes};
use iob_util::*;

lazy_static::lazy_static! {
    static ref TOP_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-r, --result=[FILE]          'Result ledger (json lines)'
             -a, --args=[FILE]            'Loads base command line arguments from FILE'
             -L, --location=[PATH]        'Target device or file (dfl: {dfl_location})'
                 --bench-bin=[PROG]       'Native load generator (dfl: {dfl_bench_bin})'
                 --fio-bin=[PROG]         'fio binary (dfl: {dfl_fio_bin})'
                 --timeout=[DUR]          'Per-invocation timeout, 0 for 5M + run duration'
                 --tail=[LINES]           'Only parse the last LINES lines of output, 0 for all (dfl: {dfl_tail})'
                 --attempts=[N]           'Attempts per point (dfl: {dfl_attempts})'
                 --require=[POLICY]       'Required fields, \"throughput\", \"full\" or a list (dfl: {dfl_require})'
                 --reset-cmd=[CMD]        'Device reset command run before retries'
                 --reset-between-attempts 'Run the reset command before every retry'
                 --no-reset-between-attempts 'Do not run the reset command before retries'
                 --engines=[LIST]         'Engines to sweep (sync, io_uring, fio)'
                 --ops=[LIST]             'Operations to sweep (read, write)'
                 --methods=[LIST]         'Access methods to sweep (seq, rand)'
                 --threads=[LIST]         'Thread counts to sweep'
                 --qds=[LIST]             'Queue depths to sweep'
                 --page-sizes=[LIST]      'Page sizes to sweep'
                 --runs=[N]               'Number of runs per configuration'
                 --durations=[LIST]       'Run durations to sweep'
             -v...                        'Sets the level of verbosity'",
            dfl_location = &dfl.location,
            dfl_bench_bin = &dfl.bench_bin,
            dfl_fio_bin = &dfl.fio_bin,
            dfl_tail = dfl.tail,
            dfl_attempts = dfl.attempts,
            dfl_require = &dfl.require,
        )
    };
    static ref MONITOR_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-d, --device=[NAME]          'Device name for iostat, derived from --location if not given'
                 --lead=[SECS]            'Start the monitors SECS before the run (dfl: {dfl_lead})'
             -o, --out=[DIR]              'Directory for the logs and the report (dfl: {dfl_out})'
                 --iostat-bin=[PROG]      'iostat binary (dfl: {dfl_iostat})'
                 --sar-bin=[PROG]         'sar binary (dfl: {dfl_sar})'",
            dfl_lead = dfl.lead,
            dfl_out = &dfl.out,
            dfl_iostat = &dfl.iostat_bin,
            dfl_sar = &dfl.sar_bin,
        )
    };
    static ref COMPARE_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "    --baseline=[ENGINE]      'Baseline engine (dfl: {dfl_baseline})'
                 --variant=[ENGINE]       'Variant engine (dfl: {dfl_variant})'
                 --metric=[FIELD]         'Compared field (dfl: {dfl_metric})'",
            dfl_baseline = &dfl.baseline,
            dfl_variant = &dfl.variant,
            dfl_metric = dfl.metric,
        )
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    Run,
    Monitor,
    Compare,
    Format,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub location: String,
    pub bench_bin: String,
    pub fio_bin: String,
    pub timeout: Option<f64>,
    pub tail: usize,
    pub attempts: u32,
    pub require: Completeness,
    pub reset_cmd: Option<String>,
    pub reset_between_attempts: bool,
    pub axes: SweepAxes,

    pub device: Option<String>,
    pub lead: u64,
    pub out: String,
    pub iostat_bin: String,
    pub sar_bin: String,

    pub baseline: String,
    pub variant: String,
    pub metric: Field,

    pub mode: Mode,

    #[serde(skip)]
    pub result: String,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            location: "/dev/nvme0n1".into(),
            bench_bin: "io_benchmark".into(),
            fio_bin: "fio".into(),
            timeout: None,
            tail: Self::DFL_TAIL,
            attempts: Self::DFL_ATTEMPTS,
            require: Completeness::throughput(),
            reset_cmd: None,
            reset_between_attempts: false,
            axes: Default::default(),
            device: None,
            lead: 2,
            out: "monitoring_logs".into(),
            iostat_bin: "iostat".into(),
            sar_bin: "sar".into(),
            baseline: "sync".into(),
            variant: "io_uring".into(),
            metric: Field::Iops,
            mode: Mode::Run,
            result: "".into(),
            verbosity: 0,
        }
    }
}

impl Args {
    pub const DFL_TAIL: usize = 64;
    pub const DFL_ATTEMPTS: u32 = 3;
    pub const DFL_TIMEOUT_BASE: f64 = 300.0;

    /// Timeout for a run of `duration` seconds.
    pub fn run_timeout(&self, duration: u64) -> f64 {
        match self.timeout {
            Some(v) if v > 0.0 => v,
            _ => Self::DFL_TIMEOUT_BASE + duration as f64,
        }
    }

    /// iostat device name, e.g. "nvme0n1" for "/dev/nvme0n1".
    pub fn monitor_device(&self) -> String {
        match self.device.as_ref() {
            Some(dev) => dev.clone(),
            None => self
                .location
                .rsplit('/')
                .next()
                .unwrap_or(&self.location)
                .to_string(),
        }
    }

    fn process_axes(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = SweepAxes::default();
        let axes = &mut self.axes;
        let mut updated = false;

        if let Some(v) = matches.value_of("engines") {
            axes.engines = match v {
                "" => dfl.engines.clone(),
                v => parse_list(v)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("ops") {
            axes.operations = match v {
                "" => dfl.operations.clone(),
                v => parse_list_with(v, Operation::parse)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("methods") {
            axes.methods = match v {
                "" => dfl.methods.clone(),
                v => parse_list_with(v, AccessMethod::parse)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("threads") {
            axes.threads = match v {
                "" => dfl.threads.clone(),
                v => parse_list(v)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("qds") {
            axes.queue_depths = match v {
                "" => dfl.queue_depths.clone(),
                v => parse_list(v)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("page-sizes") {
            axes.page_sizes = match v {
                "" => dfl.page_sizes.clone(),
                v => parse_list_with(v, parse_size)?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("runs") {
            axes.nr_runs = match v {
                "" => dfl.nr_runs,
                v => v.parse::<u32>()?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("durations") {
            axes.durations = match v {
                "" => dfl.durations.clone(),
                v => parse_list_with(v, |x| Ok(parse_duration(x)?.round() as u64))?,
            };
            updated = true;
        }

        Ok(updated)
    }

    fn process_monitor(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        if let Some(v) = subm.value_of("device") {
            self.device = match v {
                "" => None,
                v => Some(v.to_string()),
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("lead") {
            self.lead = match v {
                "" => dfl.lead,
                v => parse_duration(v)?.round() as u64,
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("out") {
            self.out = match v {
                "" => dfl.out,
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("iostat-bin") {
            self.iostat_bin = match v {
                "" => dfl.iostat_bin,
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("sar-bin") {
            self.sar_bin = match v {
                "" => dfl.sar_bin,
                v => v.to_string(),
            };
            updated = true;
        }
        Ok(updated)
    }

    fn process_compare(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        if let Some(v) = subm.value_of("baseline") {
            self.baseline = match v {
                "" => dfl.baseline,
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("variant") {
            self.variant = match v {
                "" => dfl.variant,
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("metric") {
            self.metric = match v {
                "" => dfl.metric,
                v => Field::parse(v)?,
            };
            updated = true;
        }
        Ok(updated)
    }

    fn process_subcommand(&mut self, mode: Mode, subm: &clap::ArgMatches) -> Result<bool> {
        let mut updated = false;

        if self.mode != mode {
            self.mode = mode;
            updated = true;
        }

        match mode {
            Mode::Monitor => updated |= self.process_monitor(subm)?,
            Mode::Compare => updated |= self.process_compare(subm)?,
            _ => {}
        }
        Ok(updated)
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some("// iob-sweep base arguments, command line values override these\n".into())
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("iob-sweep")
            .version(*super::VERSION)
            .about("Storage I/O parameter sweep driver")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .args_from_usage(&TOP_ARGS_STR)
            .subcommand(clap::SubCommand::with_name("run").about("Runs or resumes the sweep"))
            .subcommand(
                clap::SubCommand::with_name("monitor")
                    .about("Runs a single point with iostat and sar monitoring")
                    .args_from_usage(&MONITOR_ARGS_STR),
            )
            .subcommand(
                clap::SubCommand::with_name("compare")
                    .about("Compares two engines over the queue depth axis")
                    .args_from_usage(&COMPARE_ARGS_STR),
            )
            .subcommand(clap::SubCommand::with_name("format").about("Formats the result ledger"))
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        if let Some(v) = matches.value_of("location") {
            self.location = match v {
                "" => dfl.location.clone(),
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("bench-bin") {
            self.bench_bin = match v {
                "" => dfl.bench_bin.clone(),
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("fio-bin") {
            self.fio_bin = match v {
                "" => dfl.fio_bin.clone(),
                v => v.to_string(),
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("timeout") {
            self.timeout = match v {
                "" => None,
                v => Some(parse_duration(v).context("Parsing --timeout")?).filter(|v| *v > 0.0),
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("tail") {
            self.tail = match v {
                "" => dfl.tail,
                v => v.parse::<usize>().context("Parsing --tail")?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("attempts") {
            self.attempts = match v {
                "" => dfl.attempts,
                v => v.parse::<u32>().context("Parsing --attempts")?.max(1),
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("require") {
            self.require = match v {
                "" => dfl.require.clone(),
                v => Completeness::parse(v).context("Parsing --require")?,
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("reset-cmd") {
            self.reset_cmd = match v {
                "" => None,
                v => Some(v.to_string()),
            };
            updated = true;
        }
        if matches.is_present("reset-between-attempts") {
            self.reset_between_attempts = true;
            updated = true;
        }
        if matches.is_present("no-reset-between-attempts") {
            self.reset_between_attempts = false;
            updated = true;
        }

        updated |= self.process_axes(matches).context("Parsing sweep axes")?;

        self.result = matches.value_of("result").unwrap_or("").into();
        self.verbosity = Self::verbosity(matches);

        updated |= match matches.subcommand() {
            ("run", Some(subm)) => self.process_subcommand(Mode::Run, subm)?,
            ("monitor", Some(subm)) => self.process_subcommand(Mode::Monitor, subm)?,
            ("compare", Some(subm)) => self.process_subcommand(Mode::Compare, subm)?,
            ("format", Some(subm)) => self.process_subcommand(Mode::Format, subm)?,
            _ => false,
        };

        if self.mode != Mode::Monitor && self.result.len() == 0 {
            bail!("{:?} requires --result", &self.mode);
        }
        self.axes.verify()?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_timeout() {
        let _ = ::env_logger::try_init();
        let mut args = Args::default();
        assert_eq!(args.run_timeout(30), 330.0);
        args.timeout = Some(10.0);
        assert_eq!(args.run_timeout(30), 10.0);
    }

    #[test]
    fn test_monitor_device() {
        let _ = ::env_logger::try_init();
        let mut args = Args::default();
        assert_eq!(args.monitor_device(), "nvme0n1");
        args.device = Some("sdb".into());
        assert_eq!(args.monitor_device(), "sdb");
    }

    #[test]
    fn test_args_json_defaults() {
        let _ = ::env_logger::try_init();
        let args: Args =
            serde_json::from_str(r#"{ "attempts": 5, "axes": { "nr_runs": 2 } }"#).unwrap();
        assert_eq!(args.attempts, 5);
        assert_eq!(args.tail, Args::DFL_TAIL);
        assert_eq!(args.axes.nr_runs, 2);
        assert_eq!(args.axes.queue_depths, SweepAxes::default().queue_depths);
        assert_eq!(args.mode, Mode::Run);
    }
}
