//! Where epoch metrics and preview images go.
//!
//! Sinks are best effort: the training loop logs their errors and carries on.

use std::{
    collections::{ hash_map::Entry, HashMap },
    fs::{ self, File, OpenOptions },
    io::{ BufWriter, Write },
    path::{ Path, PathBuf },
    sync::mpsc::Sender,
};

use image::RgbImage;
use serde::Serialize;
use ui::state::TrainingState;

use crate::error::{ SegError, SegResult };
use crate::metrics::SegMetrics;
use crate::run::{ RunIdentity, RunMode };

pub trait MetricsSink {
    fn add_scalar(&mut self, mode: RunMode, tag: &str, value: f64, step: u64) -> SegResult<()>;

    fn add_image(&mut self, mode: RunMode, tag: &str, image: &RgbImage, step: u64) -> SegResult<()>;

    /// Writes the epoch's scalars, named `seg_{name}`.
    fn add_metrics(
        &mut self,
        mode: RunMode,
        _epoch: usize,
        metrics: &SegMetrics,
        step: u64
    ) -> SegResult<()> {
        add_metric_scalars(self, mode, metrics, step)
    }

    fn epoch_started(&mut self, _epoch: usize, _epochs: usize, _batch_size: usize) {}

    fn batch_progress(&mut self, _mode: RunMode, _batch_ndx: usize, _batches: usize) {}

    fn best_score(&mut self, _epoch: usize, _score: f64) {}

    fn finish(&mut self) -> SegResult<()> {
        Ok(())
    }
}

/// Writes every scalar of `metrics` through `sink.add_scalar`, named `seg_{name}`.
pub fn add_metric_scalars<S: MetricsSink + ?Sized>(
    sink: &mut S,
    mode: RunMode,
    metrics: &SegMetrics,
    step: u64
) -> SegResult<()> {
    for (name, value) in metrics.scalars() {
        sink.add_scalar(mode, &format!("seg_{name}"), value, step)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ScalarRow<'a> {
    step: u64,
    tag: &'a str,
    value: f64,
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    epoch: usize,
    step: u64,
    #[serde(flatten)]
    metrics: &'a SegMetrics,
}

struct ModeWriter {
    dir: PathBuf,
    scalars: csv::Writer<File>,
    metrics: BufWriter<File>,
}

/// Writes `scalars.csv`, `metrics.jsonl`, `run.json` and PNG previews into
/// one directory per data source. Directories appear on first write.
pub struct RunWriter {
    run: RunIdentity,
    runs_root: PathBuf,
    config: serde_json::Value,
    writers: HashMap<RunMode, ModeWriter>,
}

impl RunWriter {
    pub fn new(run: RunIdentity, runs_root: impl Into<PathBuf>, config: &impl Serialize) -> Self {
        RunWriter {
            run,
            runs_root: runs_root.into(),
            config: serde_json::to_value(config).unwrap_or_else(|e| {
                log::warn!("Failed to serialize the run config, run.json will be null: {}", e);
                serde_json::Value::Null
            }),
            writers: HashMap::new(),
        }
    }

    pub fn log_dir(&self, mode: RunMode) -> PathBuf {
        self.run.log_dir(&self.runs_root, mode)
    }

    fn writer(&mut self, mode: RunMode) -> SegResult<&mut ModeWriter> {
        let dir = self.run.log_dir(&self.runs_root, mode);
        match self.writers.entry(mode) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(ModeWriter::open(dir, &self.config)?)),
        }
    }
}

impl ModeWriter {
    fn open(dir: PathBuf, config: &serde_json::Value) -> SegResult<Self> {
        fs::create_dir_all(&dir).map_err(|e| SegError::io(&dir, e))?;

        let config_path = dir.join("run.json");
        let file = File::create(&config_path).map_err(|e| SegError::io(&config_path, e))?;
        serde_json::to_writer_pretty(file, config).map_err(|source| SegError::Json {
            path: config_path.clone(),
            source,
        })?;

        let scalars_path = dir.join("scalars.csv");
        let scalars = csv::Writer::from_path(&scalars_path).map_err(|source| SegError::Csv {
            path: scalars_path.clone(),
            source,
        })?;

        let metrics_path = dir.join("metrics.jsonl");
        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .map_err(|e| SegError::io(&metrics_path, e))?;

        Ok(ModeWriter {
            dir,
            scalars,
            metrics: BufWriter::new(metrics),
        })
    }
}

impl MetricsSink for RunWriter {
    fn add_scalar(&mut self, mode: RunMode, tag: &str, value: f64, step: u64) -> SegResult<()> {
        let writer = self.writer(mode)?;
        let path = writer.dir.join("scalars.csv");
        writer.scalars
            .serialize(ScalarRow { step, tag, value })
            .map_err(|source| SegError::Csv { path, source })
    }

    fn add_image(&mut self, mode: RunMode, tag: &str, image: &RgbImage, step: u64) -> SegResult<()> {
        let writer = self.writer(mode)?;
        let path = image_path(&writer.dir, tag, step);
        if let Some(images) = path.parent() {
            fs::create_dir_all(images).map_err(|e| SegError::io(images, e))?;
        }
        image.save(&path).map_err(|source| SegError::Image { tag: tag.to_string(), source })
    }

    fn add_metrics(
        &mut self,
        mode: RunMode,
        epoch: usize,
        metrics: &SegMetrics,
        step: u64
    ) -> SegResult<()> {
        add_metric_scalars(self, mode, metrics, step)?;

        let writer = self.writer(mode)?;
        let scalars_path = writer.dir.join("scalars.csv");
        let metrics_path = writer.dir.join("metrics.jsonl");
        writer.scalars.flush().map_err(|e| SegError::io(&scalars_path, e))?;

        serde_json::to_writer(&mut writer.metrics, &(MetricsLine { epoch, step, metrics })).map_err(
            |source| SegError::Json { path: metrics_path.clone(), source }
        )?;
        writer.metrics.write_all(b"\n").map_err(|e| SegError::io(&metrics_path, e))?;
        writer.metrics.flush().map_err(|e| SegError::io(&metrics_path, e))
    }

    fn finish(&mut self) -> SegResult<()> {
        for writer in self.writers.values_mut() {
            writer.scalars.flush().map_err(|e| SegError::io(writer.dir.join("scalars.csv"), e))?;
            writer.metrics.flush().map_err(|e| SegError::io(writer.dir.join("metrics.jsonl"), e))?;
        }
        Ok(())
    }
}

/// Publishes progress and metrics to the terminal dashboard.
///
/// A dashboard that went away is ignored.
pub struct DashboardSink {
    tx: Sender<TrainingState>,
    state: TrainingState,
}

impl DashboardSink {
    pub fn new(tx: Sender<TrainingState>, run: &RunIdentity) -> Self {
        let state = TrainingState {
            run_name: format!("{}/{}", run.tag, run.comment),
            ..TrainingState::default()
        };
        DashboardSink { tx, state }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    fn publish(&self) {
        let _ = self.tx.send(self.state.clone());
    }
}

impl MetricsSink for DashboardSink {
    fn add_scalar(&mut self, _mode: RunMode, _tag: &str, _value: f64, _step: u64) -> SegResult<()> {
        Ok(())
    }

    fn add_image(&mut self, _mode: RunMode, _tag: &str, _image: &RgbImage, _step: u64) -> SegResult<()> {
        Ok(())
    }

    fn add_metrics(
        &mut self,
        mode: RunMode,
        epoch: usize,
        metrics: &SegMetrics,
        step: u64
    ) -> SegResult<()> {
        let series = match mode {
            RunMode::Training => &mut self.state.train,
            RunMode::Validation => &mut self.state.validation,
        };
        series.push(step as f64, metrics.loss_all, metrics.f1_score);

        let prefix = mode.as_str();
        self.state.summary.retain(|(name, _)| !name.starts_with(prefix));
        self.state.summary.extend(
            [
                ("loss", metrics.loss_all),
                ("precision", metrics.precision),
                ("recall", metrics.recall),
                ("f1", metrics.f1_score),
                ("score", metrics.score),
            ].map(|(name, value)| (format!("{prefix} {name}"), format!("{value:.4}")))
        );
        self.state.summary.sort_by_key(|(name, _)| name.starts_with(RunMode::Validation.as_str()));
        self.state.history.push((format!("E{epoch} {prefix}"), format!("{:.4}", metrics.score)));

        self.publish();
        Ok(())
    }

    fn epoch_started(&mut self, epoch: usize, epochs: usize, batch_size: usize) {
        self.state.progress.current_epoch = epoch;
        self.state.progress.max_epoch = epochs;
        self.state.progress.batch_size = batch_size;
        self.publish();
    }

    fn batch_progress(&mut self, mode: RunMode, batch_ndx: usize, batches: usize) {
        self.state.progress.mode = mode.to_string();
        self.state.progress.current_batch = batch_ndx + 1;
        self.state.progress.max_batch = batches;
        self.publish();
    }

    fn best_score(&mut self, _epoch: usize, score: f64) {
        self.state.best_score = Some(score);
        self.publish();
    }

    fn finish(&mut self) -> SegResult<()> {
        self.state.finished = true;
        self.publish();
        Ok(())
    }
}

/// Path of the PNG [`RunWriter`] writes for an image tag.
pub fn image_path(log_dir: &Path, tag: &str, step: u64) -> PathBuf {
    log_dir.join("images").join(format!("{}-{}.png", tag.replace('/', "_"), step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn metrics(score: f64) -> SegMetrics {
        SegMetrics {
            loss_all: 0.5,
            loss_mal: 0.25,
            correct_all: 50.0,
            correct_mal: 25.0,
            precision: 0.4,
            recall: 0.5,
            f1_score: 0.44,
            score,
            all_correct: 5.0,
            all_label: 10.0,
            mal_correct: 1.0,
            mal_label: 4.0,
        }
    }

    #[test]
    fn run_writer_creates_directories_lazily() {
        let dir = tempdir().unwrap();
        let run = RunIdentity::with_time("t", "tag", "none");
        let mut writer = RunWriter::new(run, dir.path(), &serde_json::json!({ "epochs": 2 }));

        assert!(!writer.log_dir(RunMode::Training).exists());

        writer.add_metrics(RunMode::Validation, 1, &metrics(1.4), 32).unwrap();

        let tst = writer.log_dir(RunMode::Validation);
        assert_eq!(tst, dir.path().join("tag/t_tst_seg_none"));
        assert!(!writer.log_dir(RunMode::Training).exists());

        let scalars = fs::read_to_string(tst.join("scalars.csv")).unwrap();
        let lines: Vec<&str> = scalars.lines().collect();
        assert_eq!(lines[0], "step,tag,value");
        assert_eq!(lines[1], "32,seg_loss/all,0.5");
        assert_eq!(lines.len(), 8);

        let metrics_line = fs::read_to_string(tst.join("metrics.jsonl")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(metrics_line.trim()).unwrap();
        assert_eq!(parsed["epoch"], 1);
        assert_eq!(parsed["score"], 1.4);

        let config: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(tst.join("run.json")).unwrap()
        ).unwrap();
        assert_eq!(config["epochs"], 2);
    }

    #[test]
    fn unserializable_config_is_written_as_null() {
        let dir = tempdir().unwrap();
        let run = RunIdentity::with_time("t", "tag", "none");
        let config: HashMap<Vec<u8>, u8> = HashMap::from([(vec![1, 2], 3)]);
        let mut writer = RunWriter::new(run, dir.path(), &config);

        writer.add_scalar(RunMode::Training, "seg_loss/all", 0.5, 8).unwrap();

        let run_json = fs::read_to_string(writer.log_dir(RunMode::Training).join("run.json")).unwrap();
        assert_eq!(run_json.trim(), "null");
    }

    #[derive(Default)]
    struct RecordingSink {
        tags: Vec<(RunMode, String, u64)>,
    }

    impl MetricsSink for RecordingSink {
        fn add_scalar(&mut self, mode: RunMode, tag: &str, _value: f64, step: u64) -> SegResult<()> {
            self.tags.push((mode, tag.to_string(), step));
            Ok(())
        }

        fn add_image(&mut self, _mode: RunMode, _tag: &str, _image: &RgbImage, _step: u64) -> SegResult<()> {
            Ok(())
        }
    }

    #[test]
    fn default_metrics_go_out_as_prefixed_scalars() {
        let mut sink = RecordingSink::default();

        sink.add_metrics(RunMode::Training, 1, &metrics(1.1), 48).unwrap();

        let tags: Vec<&str> = sink.tags.iter().map(|(_, tag, _)| tag.as_str()).collect();
        assert_eq!(tags.len(), 7);
        assert_eq!(tags[0], "seg_loss/all");
        assert!(tags.iter().all(|tag| tag.starts_with("seg_")));
        assert!(sink.tags.iter().all(|(mode, _, step)| *mode == RunMode::Training && *step == 48));
    }

    #[test]
    fn run_writer_saves_png_previews() {
        let dir = tempdir().unwrap();
        let run = RunIdentity::with_time("t", "tag", "none");
        let mut writer = RunWriter::new(run, dir.path(), &());
        let image = RgbImage::new(4, 3);

        writer.add_image(RunMode::Training, "trn/0_prediction_3", &image, 64).unwrap();

        let path = image_path(&writer.log_dir(RunMode::Training), "trn/0_prediction_3", 64);
        assert!(path.ends_with("images/trn_0_prediction_3-64.png"));
        assert_eq!(image::open(path).unwrap().to_rgb8().dimensions(), (4, 3));
    }

    #[test]
    fn dashboard_sink_tracks_series_and_ignores_a_closed_channel() {
        let (tx, rx) = mpsc::channel();
        let run = RunIdentity::with_time("t", "tag", "none");
        let mut sink = DashboardSink::new(tx, &run);

        sink.epoch_started(1, 3, 8);
        sink.add_metrics(RunMode::Training, 1, &metrics(1.2), 16).unwrap();
        sink.add_metrics(RunMode::Validation, 1, &metrics(1.3), 16).unwrap();
        sink.add_metrics(RunMode::Training, 2, &metrics(1.25), 32).unwrap();

        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.train.loss, vec![(16.0, 0.5), (32.0, 0.5)]);
        assert_eq!(last.validation.f1_score, vec![(16.0, 0.44)]);
        assert_eq!(last.summary.len(), 10);
        assert_eq!(last.summary[0].0, "trn loss");
        assert_eq!(last.history.last().unwrap().0, "E2 trn");

        drop(rx);
        sink.batch_progress(RunMode::Validation, 0, 4);
        assert_eq!(sink.state().progress.current_batch, 1);
    }
}
