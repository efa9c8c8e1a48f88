use thiserror::Error;

/// Fatal misconfiguration. Always raised before the first forward pass.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("feedback policy {policy} needs scaling parameters, call set_normalization first")]
    ScalingNotInitialized { policy: &'static str },
    #[error("scaling vectors must have {expected} entries, got mean={mean} stddev={stddev}")]
    ScalingWidth {
        expected: usize,
        mean: usize,
        stddev: usize,
    },
    #[error("scaling stddev at feature {index} is {value}, must be finite and > 0")]
    ScalingStddev { index: usize, value: f32 },
    #[error("input_columns has {columns} entries but input_size is {input_size}")]
    InputLayout { columns: usize, input_size: usize },
    #[error("input_columns must start with PosX, PosY")]
    MissingPosition,
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("model type '{0}' is not supported, only 'MDN' is")]
    UnsupportedModel(String),
    #[error("{field}={value} is out of range ({range})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },
}

/// Evaluation outcomes callers must tell apart from an ordinary table.
#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("batch source produced no records for distance thresholds {thresholds:?}")]
    EmptyResult { thresholds: Vec<f32> },
}

/// Decoder state arrays are single-writer, single-assignment.
#[derive(Debug, Error, PartialEq)]
pub enum SlotError {
    #[error("{array}[{index}] written twice")]
    Overwrite { array: &'static str, index: usize },
    #[error("{array}[{index}] read before it was written")]
    Unwritten { array: &'static str, index: usize },
    #[error("{array} has {len} slots, index {index} out of bounds")]
    OutOfBounds {
        array: &'static str,
        index: usize,
        len: usize,
    },
}
