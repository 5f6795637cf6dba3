//! Training history and loss plots

use anyhow::Context;
use plotly::{
    common::{Mode, Title},
    layout::Axis,
    Layout, Plot, Scatter,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

pub const TRAINER_STATE_FILENAME: &str = "trainer_state.json";
pub const LOSS_PLOT_FILENAME: &str = "loss_plot.html";

/// One row of the log history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f32>,
}

impl LogEntry {
    pub fn metric(&self, name: &str) -> Option<f32> {
        self.metrics.get(name).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub run_name: String,
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn new(run_name: &str, max_steps: usize) -> Self {
        Self {
            run_name: run_name.to_string(),
            max_steps,
            ..Default::default()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// `(step, value)` pairs of every entry that recorded `metric`
    pub fn series(&self, metric: &str) -> (Vec<usize>, Vec<f32>) {
        self.log_history
            .iter()
            .filter_map(|entry| entry.metric(metric).map(|v| (entry.step, v)))
            .unzip()
    }
}

/// Writes train and eval loss curves as a standalone HTML page
pub fn plot_losses<P: AsRef<Path>>(state: &TrainerState, path: P) -> anyhow::Result<()> {
    let mut plot = Plot::new();
    for (metric, name) in [("loss", "Training loss"), ("eval_loss", "Validation loss")] {
        let (steps, values) = state.series(metric);
        if steps.is_empty() {
            continue;
        }
        let trace = Scatter::new(steps, values)
            .mode(Mode::LinesMarkers)
            .name(name);
        plot.add_trace(trace);
    }
    let layout = Layout::new()
        .title(Title::with_text(&state.run_name))
        .x_axis(Axis::new().title(Title::with_text("Step")))
        .y_axis(Axis::new().title(Title::with_text("Loss")));
    plot.set_layout(layout);

    let path = path.as_ref();
    std::fs::write(path, plot.to_html())
        .with_context(|| format!("Unable to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote loss plot");
    Ok(())
}
