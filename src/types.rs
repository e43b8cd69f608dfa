use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// A multi-channel, multi-trial recording.
///
/// Every trial is a block shaped `[num_channels, num_samples]` whose channel
/// axis follows `labels`. Each trial has its own time axis giving the sample
/// timestamps, so trials may differ in length.
///
/// # Examples
///
/// ```
/// use ndarray::{Array1, Array2};
/// use recording_merge::Dataset;
///
/// let dataset = Dataset::new(
///     vec!["Fz".to_string(), "Cz".to_string()],
///     vec![Array2::zeros((2, 10))],
///     vec![Array1::range(0.0, 10.0, 1.0)],
/// )
/// .unwrap();
///
/// assert_eq!(dataset.num_channels(), 2);
/// assert_eq!(dataset.num_trials(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Identifier of the recording (typically its source file)
    pub name: Option<String>,
    /// Channel names, unique within the dataset; order defines the channel axis
    pub labels: Vec<String>,
    /// Trial blocks
    /// - Shape: [num_channels, num_samples]
    pub trials: Vec<Array2<f64>>,
    /// Sample timestamps, one axis per trial
    pub time_axes: Vec<Array1<f64>>,
    /// Trial definition rows (e.g. begin sample, end sample, offset), one row per trial
    pub trial_definition: Option<Array2<f64>>,
    /// Record of the merge that produced this dataset, if any
    pub provenance: Option<Provenance>,
}

impl Dataset {
    /// Creates a dataset and checks that labels, trials and time axes agree.
    pub fn new(
        labels: Vec<String>,
        trials: Vec<Array2<f64>>,
        time_axes: Vec<Array1<f64>>,
    ) -> Result<Self, MergeError> {
        let dataset = Dataset {
            name: None,
            labels,
            trials,
            time_axes,
            trial_definition: None,
            provenance: None,
        };
        dataset.validate(0)?;
        Ok(dataset)
    }

    /// Sets the dataset name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches a trial definition (one row per trial).
    pub fn with_trial_definition(mut self, trial_definition: Array2<f64>) -> Self {
        self.trial_definition = Some(trial_definition);
        self
    }

    /// Returns the number of channels.
    pub fn num_channels(&self) -> usize {
        self.labels.len()
    }

    /// Returns the number of trials.
    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    /// Returns the total number of samples summed over all trials.
    pub fn total_samples(&self) -> usize {
        self.time_axes.iter().map(|axis| axis.len()).sum()
    }

    /// Returns the position of `label` on the channel axis.
    pub fn channel_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Checks the structural invariants of a dataset.
    ///
    /// `position` is the dataset's place in a merge call and is only used
    /// to make the error point at the offending input. Label uniqueness is
    /// checked when labels are indexed, not here.
    pub fn validate(&self, position: usize) -> Result<(), MergeError> {
        let malformed = |reason: String| MergeError::MalformedDataset {
            dataset: position,
            reason,
        };

        if self.trials.len() != self.time_axes.len() {
            return Err(malformed(format!(
                "{} trials but {} time axes",
                self.trials.len(),
                self.time_axes.len()
            )));
        }

        for (trial, (block, axis)) in self.trials.iter().zip(&self.time_axes).enumerate() {
            let (channels, samples) = block.dim();
            if channels != self.labels.len() {
                return Err(malformed(format!(
                    "trial {} has {} channels but {} labels",
                    trial,
                    channels,
                    self.labels.len()
                )));
            }
            if samples != axis.len() {
                return Err(malformed(format!(
                    "trial {} has {} samples but its time axis has {}",
                    trial,
                    samples,
                    axis.len()
                )));
            }
        }

        if let Some(definition) = &self.trial_definition {
            if definition.nrows() != self.trials.len() {
                return Err(malformed(format!(
                    "trial definition has {} rows for {} trials",
                    definition.nrows(),
                    self.trials.len()
                )));
            }
        }

        Ok(())
    }
}

/// How a set of datasets is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    /// Same channels, trials stacked end to end
    TrialConcat,
    /// Same trials, channels stacked within each trial
    ChannelConcat,
    /// No consistent merge exists
    Unresolvable(Unresolvable),
}

/// Reason a merge mode could not be inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unresolvable {
    /// Both trial and channel concatenation fit the labels
    Ambiguous,
    /// Neither trial nor channel concatenation fits the labels
    Inconsistent,
}

/// Which axis to merge along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeDimension {
    /// Infer the mode from the channel labels
    #[default]
    Auto,
    /// Concatenate trials
    Trials,
    /// Concatenate channels
    Channels,
}

/// Options for a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Axis to merge along; `Auto` infers it from the labels
    pub dimension: MergeDimension,
}

/// Record of how a merged dataset was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Mode the inputs were merged with
    pub mode: MergeMode,
    /// One record per input, in input order
    pub sources: Vec<SourceRecord>,
}

/// Summary of one merge input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Position of the input in the merge call
    pub position: usize,
    /// Name of the input dataset
    pub name: Option<String>,
    /// Channel labels of the input, in its own order
    pub labels: Vec<String>,
    /// Number of trials in the input
    pub num_trials: usize,
    /// Trial definition of the input, if it had one
    pub trial_definition: Option<Array2<f64>>,
    /// Provenance of the input, if it was itself a merge result
    pub previous: Option<Box<Provenance>>,
}

impl SourceRecord {
    pub(crate) fn from_dataset(position: usize, dataset: &Dataset) -> Self {
        SourceRecord {
            position,
            name: dataset.name.clone(),
            labels: dataset.labels.clone(),
            num_trials: dataset.num_trials(),
            trial_definition: dataset.trial_definition.clone(),
            previous: dataset.provenance.clone().map(Box::new),
        }
    }
}

/// Errors raised while merging datasets.
///
/// Every variant aborts the whole merge; no partial result is returned.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Fewer than two datasets were supplied
    #[error("at least two datasets are needed for a merge, got {0}")]
    InsufficientInput(usize),

    /// A dataset repeats a channel label
    #[error("dataset {dataset} has duplicate channel label '{label}'")]
    DuplicateLabel { dataset: usize, label: String },

    /// A dataset breaks the trial/time-axis/label invariants
    #[error("dataset {dataset} is malformed: {reason}")]
    MalformedDataset { dataset: usize, reason: String },

    /// Labels fit both trial and channel concatenation
    #[error(
        "cannot infer merge mode: {reason}; the labels are consistent with both trial and \
         channel concatenation, set the merge dimension explicitly"
    )]
    AmbiguousMerge { reason: String },

    /// Labels fit neither trial nor channel concatenation
    #[error(
        "inconsistent channel labels: {reason}; trial concatenation needs labels shared by \
         every dataset, channel concatenation needs each label in exactly one dataset"
    )]
    InconsistentLabels { reason: String },

    /// Channel concatenation over datasets with different trial counts
    #[error("dataset {dataset} has {found} trials, expected {expected}")]
    TrialCountMismatch {
        dataset: usize,
        expected: usize,
        found: usize,
    },

    /// Channel concatenation over trials whose time axes differ
    ///
    /// Axes are compared sample by sample with `==`, so an axis containing
    /// NaN never equals another, itself included.
    #[error("time axis of trial {trial} in dataset {dataset} differs from dataset 0")]
    TimeAxisMismatch { dataset: usize, trial: usize },

    /// Array shapes could not be combined
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Errors raised while reading or writing dataset and keyed text files.
#[derive(Debug, Error)]
pub enum FileError {
    /// The file does not start with the dataset container magic number
    #[error("unrecognized file format")]
    UnrecognizedFileFormat,

    /// The container version is newer than this reader
    #[error("unsupported file version {major}.{minor}")]
    UnsupportedVersion { major: i16, minor: i16 },

    /// The file size does not match its declared contents
    #[error("file size error")]
    FileSizeError,

    /// A length-prefixed string could not be decoded
    #[error("error reading string from file")]
    StringReadError,

    /// The contents could not be decoded
    #[error("malformed file: {0}")]
    Malformed(String),

    /// An I/O error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The loaded datasets could not be merged
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Errors raised by the rank-correlation statistic.
#[derive(Debug, Error)]
pub enum StatsError {
    /// The data block is neither 3-D nor 4-D
    #[error("expected a 3-D or 4-D block, got {0} dimensions")]
    Dimensionality(usize),

    /// The trailing dimension does not hold exactly two variables
    #[error("trailing dimension must have size 2, got {0}")]
    TrailingDimension(usize),

    /// The condition vector does not label every repetition
    #[error("{found} condition labels for {expected} repetitions")]
    ConditionLength { expected: usize, found: usize },
}
