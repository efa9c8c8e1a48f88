use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Enumerated choices (resolved once, at construction)
// ---------------------------------------------------------------------------

/// Meaning of each column of an input feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputColumn {
    PosX,
    PosY,
    VelX,
    VelY,
    /// Absolute velocity, |v|.
    Speed,
    /// Direction of travel in radians.
    Heading,
    /// Any feature the decoder cannot reconstruct from positions; fed back as zero.
    Other,
}

/// What the decoder feeds itself at the next timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackPolicy {
    /// Zeros, regardless of the sample (RNN-ZF).
    ZeroFeed,
    /// The sampled position, widened to `input_size` with zeros.
    RawSample,
    /// Sampled position plus velocity features derived from the previous input.
    Derivative,
    /// Ground-truth future step.
    TeacherForced,
}

impl FeedbackPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ZeroFeed => "zero_feed",
            Self::RawSample => "raw_sample",
            Self::Derivative => "derivative",
            Self::TeacherForced => "teacher_forced",
        }
    }

    /// Derivative feed thresholds velocities in real-world units, so it needs the scaling.
    pub fn needs_scaling(&self) -> bool {
        matches!(self, Self::Derivative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Lstm,
    LayerNormLstm,
    Gru,
}

/// Which accumulated loss drives gradients and is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossMode {
    /// Timestep 0 only, averaged over the batch.
    FirstStep,
    /// All prediction steps, averaged over batch and steps.
    FullHorizon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "MDN")]
    Mdn,
    #[serde(rename = "classifier")]
    Classifier,
}

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub input_size: usize,
    pub input_columns: Vec<InputColumn>,
    pub embedding_size: usize,
    pub rnn_size: usize,
    pub num_layers: usize,
    pub cell: CellKind,
    pub num_mixtures: usize,
    pub num_classes: usize,
    pub observation_steps: usize,
    pub prediction_steps: usize,
    pub batch_size: usize,

    pub feedback: FeedbackPolicy,
    pub velocity_threshold: f32,
    pub subsample: usize,
    pub sample_temperature: f64,

    pub dropout_prob: f64,
    pub embedding_dropout: f64,

    pub learning_rate: f64,
    pub learning_rate_min: f64,
    pub learning_rate_decay_factor: f64,
    pub max_gradient_norm: f64,
    pub loss_mode: LossMode,

    pub track_padding: bool,
    /// Loss weight applied to timesteps flagged as padding. Real steps weigh 1.
    pub padding_loss_mixture_weight: f64,
    /// Weight of the padding classifier's cross-entropy. Zero disables the term.
    pub padding_loss_logit_weight: f64,

    /// Normalised vote share a class needs before a track counts as classified.
    pub class_threshold: f64,
    pub num_samples: usize,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::Mdn,
            input_size: 4,
            input_columns: vec![
                InputColumn::PosX,
                InputColumn::PosY,
                InputColumn::VelX,
                InputColumn::VelY,
            ],
            embedding_size: 64,
            rnn_size: 128,
            num_layers: 2,
            cell: CellKind::Lstm,
            num_mixtures: 6,
            num_classes: 3,
            observation_steps: 20,
            prediction_steps: 20,
            batch_size: 64,
            feedback: FeedbackPolicy::Derivative,
            velocity_threshold: 0.1,
            subsample: 1,
            sample_temperature: 1.0,
            dropout_prob: 0.0,
            embedding_dropout: 0.0,
            learning_rate: 1e-3,
            learning_rate_min: 1e-5,
            learning_rate_decay_factor: 0.99,
            max_gradient_norm: 10.0,
            loss_mode: LossMode::FullHorizon,
            track_padding: true,
            padding_loss_mixture_weight: 0.0,
            padding_loss_logit_weight: 1.0,
            class_threshold: 0.95,
            num_samples: 1,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Small config for unit tests (fast on CPU).
    pub fn tiny() -> Self {
        Self {
            embedding_size: 8,
            rnn_size: 16,
            num_layers: 1,
            num_mixtures: 2,
            num_classes: 2,
            observation_steps: 4,
            prediction_steps: 5,
            batch_size: 4,
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Width of the MDN parameter vector.
    pub fn mdn_width(&self) -> usize {
        6 * self.num_mixtures
    }

    pub fn column_index(&self, column: InputColumn) -> Option<usize> {
        self.input_columns.iter().position(|&c| c == column)
    }

    /// Every configuration-only check. Scaling readiness is checked by the model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_type != ModelType::Mdn {
            return Err(ConfigError::UnsupportedModel(format!("{:?}", self.model_type)));
        }
        for (field, value) in [
            ("input_size", self.input_size),
            ("embedding_size", self.embedding_size),
            ("rnn_size", self.rnn_size),
            ("num_layers", self.num_layers),
            ("num_mixtures", self.num_mixtures),
            ("num_classes", self.num_classes),
            ("observation_steps", self.observation_steps),
            ("prediction_steps", self.prediction_steps),
            ("batch_size", self.batch_size),
            ("subsample", self.subsample),
            ("num_samples", self.num_samples),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.input_columns.len() != self.input_size {
            return Err(ConfigError::InputLayout {
                columns: self.input_columns.len(),
                input_size: self.input_size,
            });
        }
        if self.input_size < 2
            || self.column_index(InputColumn::PosX) != Some(0)
            || self.column_index(InputColumn::PosY) != Some(1)
        {
            return Err(ConfigError::MissingPosition);
        }
        check_range("sample_temperature", self.sample_temperature, 0.0, f64::MAX, "0 <= t")?;
        check_range("dropout_prob", self.dropout_prob, 0.0, 0.999, "0 <= p < 1")?;
        check_range("embedding_dropout", self.embedding_dropout, 0.0, 0.999, "0 <= p < 1")?;
        check_range("class_threshold", self.class_threshold, 0.0, 1.0, "0 <= t <= 1")?;
        check_range(
            "padding_loss_mixture_weight",
            self.padding_loss_mixture_weight,
            0.0,
            1.0,
            "0 <= w <= 1",
        )?;
        check_range("max_gradient_norm", self.max_gradient_norm, 1e-12, f64::MAX, "> 0")?;
        check_range("learning_rate", self.learning_rate, 0.0, f64::MAX, ">= 0")?;
        check_range(
            "learning_rate_decay_factor",
            self.learning_rate_decay_factor,
            0.0,
            1.0,
            "0 <= d <= 1",
        )?;
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    lo: f64,
    hi: f64,
    range: &'static str,
) -> Result<(), ConfigError> {
    if value.is_finite() && value >= lo && value <= hi {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value, range })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_tiny_validate() {
        assert_eq!(ModelConfig::default().validate(), Ok(()));
        assert_eq!(ModelConfig::tiny().validate(), Ok(()));
        assert_eq!(ModelConfig::tiny().mdn_width(), 12);
    }

    #[test]
    fn test_classifier_rejected() {
        let cfg = ModelConfig {
            model_type: ModelType::Classifier,
            ..ModelConfig::tiny()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedModel(_))));
    }

    #[test]
    fn test_layout_mismatch() {
        let cfg = ModelConfig {
            input_size: 5,
            ..ModelConfig::tiny()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InputLayout { columns: 4, input_size: 5 })
        );
    }

    #[test]
    fn test_zero_prediction_steps() {
        let cfg = ModelConfig {
            prediction_steps: 0,
            ..ModelConfig::tiny()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero { field: "prediction_steps" })
        );
    }

    #[test]
    fn test_json_round_trip_with_partial_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"model_type": "MDN", "feedback": "zero_feed", "cell": "gru", "prediction_steps": 7}"#,
        )?;
        let cfg = ModelConfig::load(&path)?;
        assert_eq!(cfg.feedback, FeedbackPolicy::ZeroFeed);
        assert_eq!(cfg.cell, CellKind::Gru);
        assert_eq!(cfg.prediction_steps, 7);
        assert_eq!(cfg.num_mixtures, ModelConfig::default().num_mixtures);
        Ok(())
    }
}
