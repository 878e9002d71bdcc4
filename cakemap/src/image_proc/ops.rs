//! Orientation operations applied to every image of a detector.

use ndarray::{s, Array2};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// One flip or quarter-turn applied to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOp {
    /// Reverse row order (`flipud`)
    FlipUd,
    /// Reverse column order (`fliplr`)
    FlipLr,
    /// Rotate 90° clockwise (`rotcw`)
    RotCw,
    /// Rotate 90° counter-clockwise (`rotccw`)
    RotCcw,
}

impl FromStr for DataOp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flipud" => Ok(DataOp::FlipUd),
            "fliplr" => Ok(DataOp::FlipLr),
            "rotcw" => Ok(DataOp::RotCw),
            "rotccw" => Ok(DataOp::RotCcw),
            other => Err(ConfigError::UnknownDataOp(other.to_string())),
        }
    }
}

impl fmt::Display for DataOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataOp::FlipUd => "flipud",
            DataOp::FlipLr => "fliplr",
            DataOp::RotCw => "rotcw",
            DataOp::RotCcw => "rotccw",
        };
        write!(f, "{name}")
    }
}

/// Parse a whitespace separated op list; blank tokens are ignored.
pub fn parse_ops(spec: &str) -> Result<Vec<DataOp>, ConfigError> {
    spec.split_whitespace().map(DataOp::from_str).collect()
}

/// Apply `ops` in listed order.
pub fn apply_ops<T: Clone>(frame: Array2<T>, ops: &[DataOp]) -> Array2<T> {
    ops.iter().fold(frame, |data, op| apply_op(&data, *op))
}

fn apply_op<T: Clone>(data: &Array2<T>, op: DataOp) -> Array2<T> {
    match op {
        DataOp::FlipUd => data.slice(s![..;-1, ..]).to_owned(),
        DataOp::FlipLr => data.slice(s![.., ..;-1]).to_owned(),
        DataOp::RotCw => data.t().slice(s![.., ..;-1]).to_owned(),
        DataOp::RotCcw => data.t().slice(s![..;-1, ..]).to_owned(),
    }
}
