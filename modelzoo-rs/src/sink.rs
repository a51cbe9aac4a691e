//! Per-epoch metric sinks, called from the main process only.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use crate::error::{Result, ZooError};

/// Key of the mean training loss in an epoch record.
pub const TRAIN_LOSS: &str = "train_loss";
/// Key of the mean validation loss in an epoch record.
pub const VAL_LOSS: &str = "val_loss";

/// Receives a flat metric map once per epoch.
pub trait MetricSink {
    /// Record the metrics of a completed epoch.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot write.
    fn record(&self, epoch: usize, metrics: &BTreeMap<String, f64>) -> Result<()>;
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, epoch: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let rendered = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(
            epoch,
            train_loss = metrics.get(TRAIN_LOSS).copied(),
            val_loss = metrics.get(VAL_LOSS).copied(),
            "Epoch metrics: {rendered}"
        );
        Ok(())
    }
}

/// Writes `pipe:{"epoch":..,"train_loss":..,"val_loss":..}` lines for a
/// supervising process that reads this one's stdout.
#[derive(Debug)]
pub struct PipeSink<W: Write + Send> {
    out: Mutex<W>,
}

impl PipeSink<std::io::Stdout> {
    /// Sink writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> PipeSink<W> {
    /// Sink writing to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer panicked while holding the lock.
    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|_| ZooError::Training("pipe sink lock poisoned".into()))
    }
}

impl<W: Write + Send> MetricSink for PipeSink<W> {
    fn record(&self, epoch: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let line = serde_json::json!({
            "epoch": epoch,
            "train_loss": metrics.get(TRAIN_LOSS),
            "val_loss": metrics.get(VAL_LOSS),
        });
        let mut out = self
            .out
            .lock()
            .map_err(|_| ZooError::Training("pipe sink lock poisoned".into()))?;
        writeln!(out, "pipe:{line}")?;
        out.flush()?;
        Ok(())
    }
}
