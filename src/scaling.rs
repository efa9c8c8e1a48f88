use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-feature (mean, stddev) normalisation, fitted once on training data.
///
/// Starts out as the identity and marked uninitialised; the only mutation is
/// [`Scaling::set`], after which it stays fixed for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    mean: Vec<f32>,
    stddev: Vec<f32>,
    initialized: bool,
}

impl Scaling {
    pub fn identity(width: usize) -> Self {
        Self {
            mean: vec![0.0; width],
            stddev: vec![1.0; width],
            initialized: false,
        }
    }

    /// Fit mean and population stddev per column. Constant columns get stddev 1.
    pub fn fit<'a>(rows: impl IntoIterator<Item = &'a [f32]>, width: usize) -> Result<Self, ConfigError> {
        let mut sum = vec![0.0f64; width];
        let mut sum_sq = vec![0.0f64; width];
        let mut n = 0usize;
        for row in rows {
            for (i, &v) in row.iter().take(width).enumerate() {
                sum[i] += v as f64;
                sum_sq[i] += (v as f64) * (v as f64);
            }
            n += 1;
        }
        if n == 0 {
            return Err(ConfigError::Zero { field: "scaling rows" });
        }
        let mean: Vec<f32> = sum.iter().map(|s| (s / n as f64) as f32).collect();
        let stddev: Vec<f32> = sum_sq
            .iter()
            .zip(&mean)
            .map(|(sq, &m)| {
                let var = (sq / n as f64 - (m as f64) * (m as f64)).max(0.0);
                let sd = var.sqrt() as f32;
                if sd > 1e-6 { sd } else { 1.0 }
            })
            .collect();
        let mut out = Self::identity(width);
        out.set(mean, stddev)?;
        Ok(out)
    }

    pub fn set(&mut self, mean: Vec<f32>, stddev: Vec<f32>) -> Result<(), ConfigError> {
        let expected = self.mean.len();
        if mean.len() != expected || stddev.len() != expected {
            return Err(ConfigError::ScalingWidth {
                expected,
                mean: mean.len(),
                stddev: stddev.len(),
            });
        }
        if let Some((index, &value)) = stddev
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || **s <= 0.0)
        {
            return Err(ConfigError::ScalingStddev { index, value });
        }
        self.mean = mean;
        self.stddev = stddev;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn stddev(&self) -> &[f32] {
        &self.stddev
    }

    /// (x - mean) / stddev over the last dimension of `x`.
    pub fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let mean = Tensor::new(self.mean.as_slice(), x.device())?;
        let stddev = Tensor::new(self.stddev.as_slice(), x.device())?;
        x.broadcast_sub(&mean)?.broadcast_div(&stddev).map_err(Into::into)
    }

    /// Model units -> real-world units for a position (first two features).
    pub fn upscale_point(&self, p: [f32; 2]) -> [f32; 2] {
        [
            p[0] * self.stddev[0] + self.mean[0],
            p[1] * self.stddev[1] + self.mean[1],
        ]
    }

    /// Real-world units -> model units for a position.
    pub fn downscale_point(&self, p: [f32; 2]) -> [f32; 2] {
        [
            (p[0] - self.mean[0]) / self.stddev[0],
            (p[1] - self.mean[1]) / self.stddev[1],
        ]
    }

    /// Stored alongside model weights in checkpoints.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        Ok((
            Tensor::new(self.mean.as_slice(), device)?,
            Tensor::new(self.stddev.as_slice(), device)?,
        ))
    }

    pub fn set_from_tensors(&mut self, mean: &Tensor, stddev: &Tensor) -> Result<()> {
        self.set(mean.to_vec1::<f32>()?, stddev.to_vec1::<f32>()?)?;
        Ok(())
    }
}
