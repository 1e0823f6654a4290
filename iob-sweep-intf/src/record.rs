// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        Ok(match input.trim() {
            "read" | "r" => Self::Read,
            "write" | "w" => Self::Write,
            v => bail!("unknown operation {:?}", v),
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    Seq,
    Rand,
}

impl AccessMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seq => "seq",
            Self::Rand => "rand",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        Ok(match input.trim() {
            "seq" | "sequential" => Self::Seq,
            "rand" | "random" => Self::Rand,
            v => bail!("unknown access method {:?}", v),
        })
    }
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of one planned measurement. Two points which differ only in
/// `run_idx` are separate measurements of the same configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParameterPoint {
    pub engine: String,
    pub operation: Operation,
    pub method: AccessMethod,
    pub threads: u32,
    pub queue_depth: u32,
    pub page_size: u64,
    pub duration: u64,
    pub run_idx: u32,
}

impl ParameterPoint {
    pub fn with_queue_depth(&self, queue_depth: u32) -> Self {
        Self {
            queue_depth,
            ..self.clone()
        }
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} threads={} qd={} bs={} dur={}s run={}",
            &self.engine,
            self.operation,
            self.method,
            self.threads,
            self.queue_depth,
            self.page_size,
            self.duration,
            self.run_idx
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    Iops,
    Bw,
    MinLat,
    MaxLat,
    AvgLat,
    TotalTime,
    TotalIos,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Iops,
        Field::Bw,
        Field::MinLat,
        Field::MaxLat,
        Field::AvgLat,
        Field::TotalTime,
        Field::TotalIos,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Iops => "iops",
            Self::Bw => "bw",
            Self::MinLat => "min_lat",
            Self::MaxLat => "max_lat",
            Self::AvgLat => "avg_lat",
            Self::TotalTime => "total_time",
            Self::TotalIos => "total_ios",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        for field in Self::ALL.iter() {
            if field.name() == input.trim() {
                return Ok(*field);
            }
        }
        bail!("unknown measurement field {:?}", input)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parsed output of one run. Latencies are in microseconds, bandwidth in
/// MB/s. Each field is filled in independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub iops: Option<f64>,
    pub bw: Option<f64>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub avg_lat: Option<f64>,
    pub total_time: Option<f64>,
    pub total_ios: Option<u64>,
}

impl Measurement {
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Iops => self.iops,
            Field::Bw => self.bw,
            Field::MinLat => self.min_lat,
            Field::MaxLat => self.max_lat,
            Field::AvgLat => self.avg_lat,
            Field::TotalTime => self.total_time,
            Field::TotalIos => self.total_ios.map(|v| v as f64),
        }
    }

    pub fn set(&mut self, field: Field, val: f64) {
        match field {
            Field::Iops => self.iops = Some(val),
            Field::Bw => self.bw = Some(val),
            Field::MinLat => self.min_lat = Some(val),
            Field::MaxLat => self.max_lat = Some(val),
            Field::AvgLat => self.avg_lat = Some(val),
            Field::TotalTime => self.total_time = Some(val),
            Field::TotalIos => self.total_ios = Some(val.max(0.0).round() as u64),
        }
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

/// Which fields must be present for a run to count as successful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completeness {
    pub required: BTreeSet<Field>,
}

impl Default for Completeness {
    fn default() -> Self {
        Self::throughput()
    }
}

impl Completeness {
    pub fn throughput() -> Self {
        Self {
            required: [Field::Iops, Field::Bw].iter().cloned().collect(),
        }
    }

    pub fn full() -> Self {
        Self {
            required: Field::ALL.iter().cloned().collect(),
        }
    }

    /// "throughput", "full" or a comma separated list of field names.
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim() {
            "throughput" => Ok(Self::throughput()),
            "full" => Ok(Self::full()),
            list => {
                let mut required = BTreeSet::new();
                for tok in list.split(',').map(|x| x.trim()).filter(|x| x.len() > 0) {
                    required.insert(Field::parse(tok)?);
                }
                if required.is_empty() {
                    bail!("empty completeness policy");
                }
                Ok(Self { required })
            }
        }
    }

    pub fn missing(&self, meas: &Measurement) -> Vec<Field> {
        self.required
            .iter()
            .filter(|f| meas.get(**f).is_none())
            .cloned()
            .collect()
    }

    pub fn is_complete(&self, meas: &Measurement) -> bool {
        self.missing(meas).is_empty()
    }
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = self.required.iter().map(|x| x.name()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(flatten)]
    pub point: ParameterPoint,
    #[serde(flatten)]
    pub meas: Measurement,
    /// Queue depth the load generator actually ran at.
    pub measured_qd: u32,
    pub recorded_at: u64,
}

impl ResultRecord {
    pub fn new(point: ParameterPoint, meas: Measurement, recorded_at: u64) -> Self {
        let measured_qd = point.queue_depth;
        Self {
            point,
            meas,
            measured_qd,
            recorded_at,
        }
    }

    /// Copies the measurement to another nominal queue depth. The copy is
    /// not a real measurement at that depth.
    pub fn broadcast_to(&self, queue_depth: u32) -> Self {
        Self {
            point: self.point.with_queue_depth(queue_depth),
            ..self.clone()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.point.queue_depth != self.measured_qd
    }
}
