// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use iob_sweep_intf::{ParameterPoint, ResultRecord};

/// Append-only json-lines ledger of result rows. Existing rows are never
/// rewritten. Every row is keyed by its ParameterPoint.
pub struct ResultStore {
    path: PathBuf,
    file: fs::File,
    keys: HashSet<ParameterPoint>,
    records: Vec<ResultRecord>,
    nr_bad_lines: usize,
}

impl ResultStore {
    pub fn open<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = path_in.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if parent.as_os_str().len() > 0 {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open result ledger {:?}", &path))?;

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("Failed to read result ledger {:?}", &path))?;

        let mut keys = HashSet::new();
        let mut records = vec![];
        let mut nr_bad_lines = 0;

        for (lineno, line) in buf.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ResultRecord>(line) {
                Ok(rec) => {
                    if keys.insert(rec.point.clone()) {
                        records.push(rec);
                    } else {
                        warn!(
                            "store: {:?}:{} duplicate row for {}, ignored",
                            &path,
                            lineno + 1,
                            &rec.point
                        );
                    }
                }
                Err(e) => {
                    warn!("store: {:?}:{} unparseable row ({})", &path, lineno + 1, &e);
                    nr_bad_lines += 1;
                }
            }
        }

        // A torn last write leaves the file without a trailing newline.
        // Terminate it so that the next row starts on its own line.
        if buf.len() > 0 && !buf.ends_with('\n') {
            warn!("store: {:?} ends with a partial row, terminating it", &path);
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        info!(
            "store: loaded {} rows from {:?}{}",
            records.len(),
            &path,
            if nr_bad_lines > 0 {
                format!(" ({} unparseable)", nr_bad_lines)
            } else {
                "".into()
            }
        );

        Ok(Self {
            path,
            file,
            keys,
            records,
            nr_bad_lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self, point: &ParameterPoint) -> bool {
        self.keys.contains(point)
    }

    pub fn get(&self, point: &ParameterPoint) -> Option<&ResultRecord> {
        if !self.keys.contains(point) {
            return None;
        }
        self.records.iter().find(|rec| &rec.point == point)
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn nr_bad_lines(&self) -> usize {
        self.nr_bad_lines
    }

    fn write_rows(&mut self, recs: &[ResultRecord]) -> Result<()> {
        let mut buf = String::new();
        for rec in recs.iter() {
            buf += &serde_json::to_string(rec)?;
            buf += "\n";
        }
        self.file
            .write_all(buf.as_bytes())
            .with_context(|| format!("Failed to append to {:?}", &self.path))?;
        self.file
            .sync_data()
            .with_context(|| format!("Failed to sync {:?}", &self.path))?;

        for rec in recs.iter() {
            self.keys.insert(rec.point.clone());
            self.records.push(rec.clone());
        }
        Ok(())
    }

    pub fn append(&mut self, rec: ResultRecord) -> Result<()> {
        if self.exists(&rec.point) {
            bail!("{} is already in {:?}", &rec.point, &self.path);
        }
        debug!("store: appending {}", &rec.point);
        self.write_rows(&[rec])
    }

    /// Appends copies of one measurement which differ only in queue depth
    /// with a single write.
    pub fn append_broadcast(&mut self, recs: Vec<ResultRecord>) -> Result<()> {
        let first = match recs.first() {
            Some(v) => v,
            None => return Ok(()),
        };

        let mut qds = HashSet::new();
        for rec in recs.iter() {
            let same = rec.point.with_queue_depth(first.point.queue_depth) == first.point
                && rec.meas == first.meas
                && rec.measured_qd == first.measured_qd
                && rec.recorded_at == first.recorded_at;
            if !same {
                bail!(
                    "broadcast rows {} and {} differ in more than queue depth",
                    &first.point,
                    &rec.point
                );
            }
            if !qds.insert(rec.point.queue_depth) {
                bail!("duplicate queue depth in broadcast rows for {}", &rec.point);
            }
            if self.exists(&rec.point) {
                bail!("{} is already in {:?}", &rec.point, &self.path);
            }
        }

        debug!(
            "store: appending {} broadcast rows for {} measured at qd={}",
            recs.len(),
            &first.point,
            first.measured_qd
        );
        self.write_rows(&recs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iob_sweep_intf::{AccessMethod, Measurement, Operation};

    fn point(qd: u32, run_idx: u32) -> ParameterPoint {
        ParameterPoint {
            engine: "sync".into(),
            operation: Operation::Read,
            method: AccessMethod::Seq,
            threads: 1,
            queue_depth: qd,
            page_size: 4096,
            duration: 10,
            run_idx,
        }
    }

    fn record(qd: u32, run_idx: u32, iops: f64) -> ResultRecord {
        let mut meas = Measurement::default();
        meas.iops = Some(iops);
        meas.bw = Some(iops * 4096.0 / 1048576.0);
        ResultRecord::new(point(qd, run_idx), meas, 1700000000)
    }

    #[test]
    fn test_append_and_reopen() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("results/ledger.jsonl");

        let mut store = ResultStore::open(&path).unwrap();
        assert!(!store.exists(&point(1, 0)));
        store.append(record(1, 0, 1000.0)).unwrap();
        store.append(record(1, 1, 1100.0)).unwrap();
        assert!(store.exists(&point(1, 0)));
        assert!(store.append(record(1, 0, 999.0)).is_err());
        drop(store);

        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.records().len(), 2);
        assert!(store.exists(&point(1, 1)));
        assert!(!store.exists(&point(2, 0)));
        assert_eq!(store.records()[1].meas.iops, Some(1100.0));

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_broadcast() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut store = ResultStore::open(&path).unwrap();

        let base = record(1, 0, 5000.0);
        let recs: Vec<ResultRecord> = [1, 2, 8, 16].iter().map(|qd| base.broadcast_to(*qd)).collect();
        store.append_broadcast(recs).unwrap();
        assert_eq!(store.records().len(), 4);
        assert_eq!(store.records().iter().filter(|r| r.is_broadcast()).count(), 3);

        let mut bad = record(1, 1, 5000.0).broadcast_to(4);
        bad.meas.iops = Some(1.0);
        let recs = vec![record(1, 1, 5000.0).broadcast_to(2), bad];
        assert!(store.append_broadcast(recs).is_err());

        let recs = vec![base.broadcast_to(32), base.broadcast_to(16)];
        assert!(store.append_broadcast(recs).is_err());
        assert_eq!(store.records().len(), 4);
        assert!(!store.exists(&point(32, 0)));

        let got = store.get(&point(8, 0)).unwrap().clone();
        assert_eq!(got.measured_qd, 1);
        assert_eq!(got.meas.iops, Some(5000.0));
        assert!(store.get(&point(32, 0)).is_none());

        // a depth added later joins the group with the stored values
        store.append_broadcast(vec![got.broadcast_to(32)]).unwrap();
        assert_eq!(store.get(&point(32, 0)).unwrap().meas, base.meas);
    }

    #[test]
    fn test_torn_and_garbage_lines() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let good = serde_json::to_string(&record(1, 0, 10.0)).unwrap();
        fs::write(&path, format!("{}\nnot json\n{{\"engine\":\"sy", good)).unwrap();

        let mut store = ResultStore::open(&path).unwrap();
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.nr_bad_lines(), 2);
        store.append(record(2, 0, 20.0)).unwrap();
        drop(store);

        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.nr_bad_lines(), 2);
    }
}
