// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{AccessMethod, Operation};

/// Ordered domains of the sweep grid. Traversal follows the field order
/// with the run index nested between page size and duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepAxes {
    pub engines: Vec<String>,
    pub operations: Vec<Operation>,
    pub methods: Vec<AccessMethod>,
    pub threads: Vec<u32>,
    pub queue_depths: Vec<u32>,
    pub page_sizes: Vec<u64>,
    pub nr_runs: u32,
    pub durations: Vec<u64>,
}

impl Default for SweepAxes {
    fn default() -> Self {
        Self {
            engines: vec!["sync".into(), "io_uring".into()],
            operations: vec![Operation::Read, Operation::Write],
            methods: vec![AccessMethod::Seq, AccessMethod::Rand],
            threads: vec![1, 2, 4, 8],
            queue_depths: vec![1, 2, 4, 8, 16, 32],
            page_sizes: vec![4096],
            nr_runs: 1,
            durations: vec![30],
        }
    }
}

impl SweepAxes {
    pub fn verify(&self) -> Result<()> {
        let empty = [
            ("engines", self.engines.is_empty()),
            ("operations", self.operations.is_empty()),
            ("methods", self.methods.is_empty()),
            ("threads", self.threads.is_empty()),
            ("queue depths", self.queue_depths.is_empty()),
            ("page sizes", self.page_sizes.is_empty()),
            ("durations", self.durations.is_empty()),
        ];
        for (name, is_empty) in empty.iter() {
            if *is_empty {
                bail!("sweep axis {} is empty", name);
            }
        }
        if self.nr_runs == 0 {
            bail!("number of runs must be positive");
        }
        if self.threads.contains(&0) || self.queue_depths.contains(&0) {
            bail!("thread counts and queue depths must be positive");
        }
        if self.page_sizes.contains(&0) {
            bail!("page sizes must be positive");
        }
        Ok(())
    }

    /// Number of grid points before any queue depth collapse.
    pub fn nr_points(&self) -> usize {
        self.engines.len()
            * self.operations.len()
            * self.methods.len()
            * self.threads.len()
            * self.queue_depths.len()
            * self.page_sizes.len()
            * self.nr_runs as usize
            * self.durations.len()
    }
}
