// Training-time metric sink.
//
// Scalars, histograms and images tagged by name and global step. Emission is
// fire-and-forget: a sink that fails to record logs a warning and moves on.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

pub trait MetricSink {
    fn scalar(&self, tag: &str, step: usize, value: f64);
    fn histogram(&self, tag: &str, step: usize, values: &[f32]);
    /// Encoded image bytes (SVG from the trainer).
    fn image(&self, tag: &str, step: usize, bytes: &[u8]);
}

/// Summary of a value distribution, stored instead of the raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f64,
    /// Counts over `buckets.len()` equal-width bins spanning [min, max].
    pub buckets: Vec<u64>,
}

impl Histogram {
    pub const BUCKETS: usize = 30;

    pub fn from_values(values: &[f32]) -> Self {
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Self {
                count: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                buckets: vec![0; Self::BUCKETS],
            };
        }
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = finite.iter().map(|&v| v as f64).sum::<f64>() / finite.len() as f64;
        let mut buckets = vec![0u64; Self::BUCKETS];
        let span = (max - min).max(f32::EPSILON);
        for v in &finite {
            let idx = (((v - min) / span) * Self::BUCKETS as f32) as usize;
            buckets[idx.min(Self::BUCKETS - 1)] += 1;
        }
        Self {
            count: finite.len(),
            min,
            max,
            mean,
            buckets,
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite sink
// ---------------------------------------------------------------------------

pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    /// Open (or create) a metrics database. ":memory:" for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scalars (
                tag TEXT NOT NULL,
                step INTEGER NOT NULL,
                value REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS histograms (
                tag TEXT NOT NULL,
                step INTEGER NOT NULL,
                summary TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS images (
                tag TEXT NOT NULL,
                step INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scalars_tag ON scalars(tag, step);",
        )?;
        Ok(Self { conn })
    }

    /// (step, value) pairs for one tag, oldest first.
    pub fn scalars(&self, tag: &str) -> Result<Vec<(usize, f64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT step, value FROM scalars WHERE tag = ?1 ORDER BY step ASC, rowid ASC")?;
        let rows = stmt.query_map(params![tag], |r| {
            let step: i64 = r.get(0)?;
            let value: f64 = r.get(1)?;
            Ok((step as usize, value))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn histograms(&self, tag: &str) -> Result<Vec<(usize, Histogram)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT step, summary FROM histograms WHERE tag = ?1 ORDER BY step ASC")?;
        let rows = stmt.query_map(params![tag], |r| {
            let step: i64 = r.get(0)?;
            let summary: String = r.get(1)?;
            Ok((step as usize, summary))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (step, summary) = row?;
            out.push((step, serde_json::from_str(&summary)?));
        }
        Ok(out)
    }

    pub fn image_count(&self, tag: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM images WHERE tag = ?1", params![tag], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn try_histogram(&self, tag: &str, step: usize, values: &[f32]) -> Result<()> {
        let summary = serde_json::to_string(&Histogram::from_values(values))?;
        self.conn.execute(
            "INSERT INTO histograms (tag, step, summary) VALUES (?1, ?2, ?3)",
            params![tag, step as i64, summary],
        )?;
        Ok(())
    }
}

impl MetricSink for SqliteSink {
    fn scalar(&self, tag: &str, step: usize, value: f64) {
        if let Err(e) = self.conn.execute(
            "INSERT INTO scalars (tag, step, value) VALUES (?1, ?2, ?3)",
            params![tag, step as i64, value],
        ) {
            tracing::warn!(tag, step, error = %e, "dropped scalar");
        }
    }

    fn histogram(&self, tag: &str, step: usize, values: &[f32]) {
        if let Err(e) = self.try_histogram(tag, step, values) {
            tracing::warn!(tag, step, error = %e, "dropped histogram");
        }
    }

    fn image(&self, tag: &str, step: usize, bytes: &[u8]) {
        if let Err(e) = self.conn.execute(
            "INSERT INTO images (tag, step, data) VALUES (?1, ?2, ?3)",
            params![tag, step as i64, bytes],
        ) {
            tracing::warn!(tag, step, error = %e, "dropped image");
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing sink
// ---------------------------------------------------------------------------

/// Emits every metric as a `tracing` event at debug level (scalars at info).
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn scalar(&self, tag: &str, step: usize, value: f64) {
        tracing::info!(target: "metrics", tag, step, value, "scalar");
    }

    fn histogram(&self, tag: &str, step: usize, values: &[f32]) {
        let h = Histogram::from_values(values);
        tracing::debug!(target: "metrics", tag, step, count = h.count, min = h.min, max = h.max, mean = h.mean, "histogram");
    }

    fn image(&self, tag: &str, step: usize, bytes: &[u8]) {
        tracing::debug!(target: "metrics", tag, step, bytes = bytes.len(), "image");
    }
}
