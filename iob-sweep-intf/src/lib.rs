// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod axes;
pub mod record;

pub use args::{Args, Mode};
pub use axes::SweepAxes;
pub use record::{
    AccessMethod, Completeness, Field, Measurement, Operation, ParameterPoint, ResultRecord,
};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
