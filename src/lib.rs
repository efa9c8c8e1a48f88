#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod batch;
pub mod cell;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod error;
pub mod evaluator;
pub mod mdn;
pub mod metrics;
pub mod model;
pub mod report;
pub mod scaling;
pub mod step;
pub mod training;
