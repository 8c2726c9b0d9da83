use std::{ fmt, path::{ Path, PathBuf } };

use chrono::Local;

/// Data source a metric or image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Training,
    Validation,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Training => "trn",
            RunMode::Validation => "tst",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a run is, and how far it has trained.
///
/// `total_training_samples` is the x-axis of every logged metric and is part
/// of every periodic checkpoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub time_str: String,
    pub tag: String,
    pub comment: String,
    pub total_training_samples: u64,
}

impl RunIdentity {
    pub fn new(tag: impl Into<String>, comment: impl Into<String>) -> Self {
        Self::with_time(Local::now().format("%Y-%m-%d_%H.%M.%S").to_string(), tag, comment)
    }

    pub fn with_time(
        time_str: impl Into<String>,
        tag: impl Into<String>,
        comment: impl Into<String>
    ) -> Self {
        RunIdentity {
            time_str: time_str.into(),
            tag: tag.into(),
            comment: comment.into(),
            total_training_samples: 0,
        }
    }

    /// `{root}/{tag}/{type}_{time}_{comment}.{suffix}.state`
    pub fn checkpoint_path(&self, root: &Path, type_str: &str, suffix: &str) -> PathBuf {
        root.join(&self.tag).join(
            format!("{}_{}_{}.{}.state", type_str, self.time_str, self.comment, suffix)
        )
    }

    /// `{runs}/{tag}/{time}_{trn|tst}_seg_{comment}`
    pub fn log_dir(&self, runs_root: &Path, mode: RunMode) -> PathBuf {
        runs_root
            .join(&self.tag)
            .join(format!("{}_{}_seg_{}", self.time_str, mode, self.comment))
    }

    /// `{runs}/{tag}/{time}.log`
    pub fn log_file(&self, runs_root: &Path) -> PathBuf {
        runs_root.join(&self.tag).join(format!("{}.log", self.time_str))
    }
}
