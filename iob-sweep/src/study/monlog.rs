// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{Series, SeriesSample};

/// Reads a monitoring log. A missing or unreadable log yields an empty
/// string which parses into no series.
pub fn read_log<P: AsRef<Path>>(path: P) -> String {
    match fs::read_to_string(path.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            warn!("monitor: failed to read {:?} ({})", path.as_ref(), &e);
            String::new()
        }
    }
}

fn parse_val(tok: &str) -> Option<f64> {
    tok.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}

fn columns_to_series(names: &[String], rows: &[Vec<Option<f64>>]) -> BTreeMap<String, Series> {
    let mut map = BTreeMap::new();
    for (col, name) in names.iter().enumerate() {
        let vals: Vec<Option<f64>> = rows.iter().map(|row| row[col]).collect();
        map.insert(name.clone(), Series::from_values(0, &vals));
    }
    map
}

/// Parses `sar -P CPU 1 N` output. The first line is a banner. The header
/// row is recognized by its `CPU` column and the columns after it name the
/// values. Each data row contributes its trailing tokens, one per column,
/// so the leading timestamp may take one or two tokens. Repeated headers
/// and `Average:` rows are skipped. The index is the data row number.
pub fn parse_sar_cpu(text: &str) -> BTreeMap<String, Series> {
    let mut names: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<Option<f64>>> = vec![];

    for line in text.lines().skip(1) {
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.is_empty() || toks[0].starts_with("Average") {
            continue;
        }
        if let Some(pos) = toks.iter().position(|t| *t == "CPU") {
            if names.is_none() {
                names = Some(toks[pos + 1..].iter().map(|x| x.to_string()).collect());
            }
            continue;
        }
        let names = match names.as_ref() {
            Some(v) => v,
            None => continue,
        };
        if toks.len() < names.len() + 1 {
            debug!("monitor: short sar row {:?}", line);
            continue;
        }
        let vals: Vec<Option<f64>> = toks[toks.len() - names.len()..]
            .iter()
            .map(|t| parse_val(t))
            .collect();
        rows.push(vals);
    }

    match names {
        Some(names) => columns_to_series(&names, &rows),
        None => BTreeMap::new(),
    }
}

/// Parses `iostat -t -dx DEV 1 N` output. The first line is a banner and
/// the `Device` row is the header. Timestamp rows and anything else whose
/// token count doesn't match the header are dropped as are repeated
/// headers. When `device` is given only its rows are kept. The device
/// column itself is dropped. The index is the data row number.
pub fn parse_iostat(text: &str, device: Option<&str>) -> BTreeMap<String, Series> {
    let mut header: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<Option<f64>>> = vec![];

    for line in text.lines().skip(1) {
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.is_empty() {
            continue;
        }
        if toks[0].starts_with("Device") {
            if header.is_none() {
                header = Some(toks.iter().map(|x| x.to_string()).collect());
            }
            continue;
        }
        let header = match header.as_ref() {
            Some(v) => v,
            None => continue,
        };
        if toks.len() != header.len() {
            continue;
        }
        if let Some(dev) = device {
            if toks[0] != dev {
                continue;
            }
        }
        rows.push(toks[1..].iter().map(|t| parse_val(t)).collect());
    }

    match header {
        Some(header) => columns_to_series(&header[1..], &rows),
        None => BTreeMap::new(),
    }
}

lazy_static::lazy_static! {
    static ref PROGRESS_RE: Regex = Regex::new(
        r"Elapsed Time:\s*([0-9.]+)s,\s*IOPS:\s*([-+0-9.eE]+),\s*Bandwidth:\s*([-+0-9.eE]+)\s*MB/s"
    )
    .unwrap();
}

/// Parses the native load generator's periodic progress lines for `worker`,
/// e.g. "Thread 0" or "All Threads". Returns the `iops` and `bw` (MB/s)
/// series indexed by elapsed seconds.
pub fn parse_progress(text: &str, worker: &str) -> BTreeMap<String, Series> {
    let tag = format!("{}:", worker);
    let mut iops = vec![];
    let mut bw = vec![];

    for line in text.split(|c| c == '\n' || c == '\r') {
        if !line.contains(&tag) {
            continue;
        }
        if let Some(caps) = PROGRESS_RE.captures(line) {
            let idx = match parse_val(&caps[1]) {
                Some(v) => v,
                None => continue,
            };
            iops.push(SeriesSample::new(idx, parse_val(&caps[2])));
            bw.push(SeriesSample::new(idx, parse_val(&caps[3])));
        }
    }

    let mut map = BTreeMap::new();
    if !iops.is_empty() {
        map.insert("iops".to_string(), Series::from_lossy(iops));
        map.insert("bw".to_string(), Series::from_lossy(bw));
    }
    map
}
