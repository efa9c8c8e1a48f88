// trajmdn: train, evaluate and report on the seq2seq MDN trajectory predictor
//
// Commands:
//   trajmdn synth     --out tracks.json           Synthetic turning tracks
//   trajmdn train     --data tracks.json --dir D   Train, keep the best checkpoint in D
//   trajmdn evaluate  --data tracks.json --dir D   Distance-binned votes + trajectories
//   trajmdn report    --dir D                      F1 and trajectory-metric summaries
//
// GPU: used when compiled with --features cuda unless --cpu is given

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use trajectory_mdn::batch::{
    load_tracks, save_tracks, split_by_track, synthetic_tracks, ClassPrototypes, TrackPool, TrackRecord,
};
use trajectory_mdn::checkpoint::CheckpointManager;
use trajectory_mdn::config::ModelConfig;
use trajectory_mdn::evaluator::{collect_predictions, evaluate, ResultTable};
use trajectory_mdn::metrics::{MetricSink, SqliteSink, TracingSink};
use trajectory_mdn::report::{baseline_predictions, Report, TrackPrediction, DEFAULT_HORIZONS};
use trajectory_mdn::step::StepDriver;
use trajectory_mdn::training::{train, TrainingConfig};

const CONFIG_FILE: &str = "config.json";
const PROTOTYPES_FILE: &str = "prototypes.json";
const RESULTS_FILE: &str = "results.json";
const PREDICTIONS_FILE: &str = "predictions.json";
const REPORT_FILE: &str = "report.json";

#[derive(Parser, Debug)]
#[command(name = "trajmdn", about = "Seq2seq MDN trajectory predictor")]
struct Cli {
    /// Force CPU even when built with CUDA.
    #[arg(long, global = true)]
    cpu: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write synthetic tracks as JSON.
    Synth {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 60)]
        tracks: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Train a model and keep its best checkpoint.
    Train {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        dir: PathBuf,
        /// Every n-th track goes to validation.
        #[arg(long, default_value_t = 5)]
        val_every: usize,
        #[arg(long, default_value_t = 2000)]
        max_steps: usize,
        #[arg(long, default_value_t = 100)]
        validate_every: usize,
        #[arg(long, default_value_t = 5)]
        patience: usize,
        #[arg(long)]
        quick_validation: bool,
        /// SQLite file for scalars, histograms and plots; logs only when absent.
        #[arg(long)]
        metrics: Option<PathBuf>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Vote-classify every track at each distance and collect trajectories.
    Evaluate {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        dir: PathBuf,
        /// `start:end:step` (end excluded) or a comma separated list.
        #[arg(long, default_value = "-10:10:1")]
        thresholds: String,
        /// Distance at which trajectories are scored.
        #[arg(long, default_value_t = 0.0)]
        reference_distance: f32,
    },
    /// Summarise evaluation output into report.json.
    Report {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// JSON model config; defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use the tiny preset instead of the defaults.
    #[arg(long)]
    tiny: bool,
}

impl ModelArgs {
    fn load(&self) -> Result<ModelConfig> {
        match (&self.config, self.tiny) {
            (Some(path), _) => ModelConfig::load(path),
            (None, true) => Ok(ModelConfig::tiny()),
            (None, false) => Ok(ModelConfig::default()),
        }
    }
}

fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    tracing::info!("using CUDA device 0");
                    return dev;
                }
                Err(e) => tracing::warn!(error = %e, "CUDA init failed, falling back to CPU"),
            }
        } else {
            tracing::info!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        tracing::debug!("built without CUDA feature, using CPU");
    }

    Device::Cpu
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trajectory_mdn=info,trajmdn=info,metrics=info")),
        )
        .init();

    let cli = Cli::parse();
    let device = select_device(cli.cpu);
    let result = match cli.command {
        Command::Synth { out, tracks, seed, model } => cmd_synth(&out, tracks, seed, &model),
        Command::Train {
            data,
            dir,
            val_every,
            max_steps,
            validate_every,
            patience,
            quick_validation,
            metrics,
            model,
        } => {
            let training = TrainingConfig {
                max_steps,
                validate_every,
                patience,
                quick_validation,
                ..TrainingConfig::default()
            };
            cmd_train(&data, &dir, val_every, &training, metrics.as_deref(), &model, &device)
        }
        Command::Evaluate {
            data,
            dir,
            thresholds,
            reference_distance,
        } => parse_thresholds(&thresholds)
            .and_then(|ts| cmd_evaluate(&data, &dir, &ts, reference_distance, &device)),
        Command::Report { dir } => cmd_report(&dir),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_synth(out: &Path, tracks: usize, seed: u64, model: &ModelArgs) -> Result<()> {
    let cfg = model.load()?;
    let records = synthetic_tracks(&cfg, tracks, seed);
    save_tracks(&records, out)?;
    tracing::info!(records = records.len(), tracks, path = %out.display(), "wrote synthetic tracks");
    Ok(())
}

fn cmd_train(
    data: &Path,
    dir: &Path,
    val_every: usize,
    training: &TrainingConfig,
    metrics: Option<&Path>,
    model: &ModelArgs,
    device: &Device,
) -> Result<()> {
    let cfg = model.load()?;
    cfg.validate()?;
    let (train_records, val_records) = split_by_track(load_tracks(data)?, val_every);
    let mut train_pool = track_pool(&cfg, train_records)?;
    let mut val_pool = track_pool(&cfg, val_records)?;
    tracing::info!(train = train_pool.len(), val = val_pool.len(), "split records");

    let scaling = train_pool.fit_scaling(cfg.input_size)?;
    let prototypes = ClassPrototypes::fit(train_pool.records(), cfg.num_classes)?;

    let mut checkpoints = CheckpointManager::new(dir)?;
    cfg.save(dir.join(CONFIG_FILE))?;
    prototypes.save(dir.join(PROTOTYPES_FILE))?;

    let mut driver = StepDriver::new(cfg, device)?;
    driver.model_mut().set_scaling(scaling)?;

    let sqlite = match metrics {
        Some(path) => Some(SqliteSink::open(&path.to_string_lossy())?),
        None => None,
    };
    let sink: &dyn MetricSink = match &sqlite {
        Some(s) => s,
        None => &TracingSink,
    };

    let summary = train(
        &mut driver,
        &mut train_pool,
        &mut val_pool,
        &prototypes,
        training,
        Some(&mut checkpoints),
        Some(sink),
    )?;
    match summary.best {
        Some((step, loss)) => println!(
            "steps={} best_step={step} best_val_loss={loss:.4} final_train_loss={:.4} stopped_early={}",
            summary.steps, summary.final_train_loss, summary.stopped_early
        ),
        None => println!(
            "steps={} final_train_loss={:.4} (no validation ran)",
            summary.steps, summary.final_train_loss
        ),
    }
    Ok(())
}

fn cmd_evaluate(data: &Path, dir: &Path, thresholds: &[f32], reference_distance: f32, device: &Device) -> Result<()> {
    let cfg = ModelConfig::load(dir.join(CONFIG_FILE))?;
    let prototypes = ClassPrototypes::load(dir.join(PROTOTYPES_FILE))?;
    let mut pool = track_pool(&cfg, load_tracks(data)?)?;

    let mut driver = StepDriver::new(cfg, device)?;
    let checkpoints = CheckpointManager::new(dir)?;
    let mut scaling = driver.model().scaling().clone();
    let Some(step) = checkpoints.restore(driver.varmap(), &mut scaling, None, device)? else {
        bail!("no checkpoint in {}", dir.display());
    };
    driver.model_mut().set_scaling(scaling)?;
    driver.set_global_step(step);
    tracing::info!(step, "restored checkpoint");

    let table = evaluate(&mut driver, &mut pool, thresholds, &prototypes)?;
    write_json(&table, &dir.join(RESULTS_FILE))?;

    let model = collect_predictions(&mut driver, &mut pool, reference_distance)?;
    let baseline = baseline_predictions(&nearest_records(pool.records(), reference_distance));
    let mut predictions = BTreeMap::new();
    predictions.insert("seq2seq_mdn".to_string(), model);
    predictions.insert("constant_velocity".to_string(), baseline);
    write_json(&predictions, &dir.join(PREDICTIONS_FILE))?;

    let correct = table.rows.iter().filter(|r| r.is_correct()).count();
    println!(
        "rows={} thresholds={} correct={:.3}",
        table.rows.len(),
        table.thresholds().len(),
        correct as f64 / table.rows.len().max(1) as f64
    );
    Ok(())
}

fn cmd_report(dir: &Path) -> Result<()> {
    let cfg = ModelConfig::load(dir.join(CONFIG_FILE))?;
    let table: ResultTable = read_json(&dir.join(RESULTS_FILE))?;
    let predictions: BTreeMap<String, Vec<TrackPrediction>> = read_json(&dir.join(PREDICTIONS_FILE))?;
    let models: Vec<(&str, &[TrackPrediction])> = predictions
        .iter()
        .map(|(name, preds)| (name.as_str(), preds.as_slice()))
        .collect();

    let report = Report::build(&table, cfg.class_threshold, &models, &DEFAULT_HORIZONS);
    report.save(dir.join(REPORT_FILE))?;

    println!("{:<12} {:>8} {:>8} {:>8} {:>8}", "metric", "median", "mean", "p95", "p99");
    for (name, s) in &report.f1_summary {
        println!("{name:<12} {:>8.3} {:>8.3} {:>8.3} {:>8.3}", s.median, s.mean, s.p95, s.p99);
    }
    for (class, d) in &report.earliest_perfect_distance {
        println!("earliest_perfect_distance {class}: {d:.2}");
    }
    for (model, metrics) in &report.trajectory {
        println!("{model}");
        for (name, s) in metrics {
            println!("  {name:<18} {:>8.3} {:>8.3} {:>8.3} {:>8.3}", s.median, s.mean, s.p95, s.p99);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn track_pool(cfg: &ModelConfig, records: Vec<TrackRecord>) -> Result<TrackPool> {
    TrackPool::new(records, cfg.batch_size, cfg.seed)
}

/// One record per track, the one whose distance is closest to `d`.
fn nearest_records(records: &[Arc<TrackRecord>], d: f32) -> Vec<Arc<TrackRecord>> {
    let mut best: BTreeMap<usize, &Arc<TrackRecord>> = BTreeMap::new();
    for r in records {
        let closer = best
            .get(&r.track_idx)
            .map_or(true, |b| (r.distance - d).abs() < (b.distance - d).abs());
        if closer {
            best.insert(r.track_idx, r);
        }
    }
    best.into_values().cloned().collect()
}

fn parse_thresholds(raw: &str) -> Result<Vec<f32>> {
    let parse = |s: &str| s.trim().parse::<f32>().with_context(|| format!("bad threshold {s:?}"));
    let parts: Vec<&str> = raw.split(':').collect();
    let out = match parts.as_slice() {
        [start, end, step] => {
            let (start, end, step) = (parse(start)?, parse(end)?, parse(step)?);
            if step <= 0.0 || end <= start {
                bail!("threshold range {raw:?} is empty");
            }
            // end is exclusive
            let n = ((end - start) / step - 1e-4).ceil() as usize;
            (0..n).map(|i| start + step * i as f32).collect()
        }
        [list] => list.split(',').map(parse).collect::<Result<Vec<_>>>()?,
        _ => bail!("thresholds must be start:end:step or a comma list, got {raw:?}"),
    };
    if out.is_empty() {
        bail!("no thresholds in {raw:?}");
    }
    Ok(out)
}

fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_range_excludes_end() -> Result<()> {
        assert_eq!(parse_thresholds("-2:2:1")?, vec![-2.0, -1.0, 0.0, 1.0]);
        assert_eq!(parse_thresholds("0:1:0.3")?.len(), 4);
        assert_eq!(parse_thresholds("1.5, 3")?, vec![1.5, 3.0]);
        assert!(parse_thresholds("2:2:1").is_err());
        assert!(parse_thresholds("0:5:0").is_err());
        Ok(())
    }
}
