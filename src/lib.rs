//! Merging of multi-channel, multi-trial time-series recordings.
//!
//! Independently preprocessed recordings are combined either by stacking
//! their trials (same channels, different sessions) or by stacking their
//! channels (same trials, different channel sets). The mode is inferred from
//! the channel labels; channel order mismatches are repaired and channels
//! missing from some inputs are dropped.

pub mod keyfile;
pub mod merge;
mod reader;
pub mod stats;
pub mod types;

use std::path::Path;

// Re-export types
pub use merge::{classify, merge, Classification, LabelIndex};
pub use types::*;

/// Loads a dataset container file.
///
/// # Examples
///
/// ```no_run
/// use recording_merge::load;
///
/// match load("path/to/session.trm") {
///     Ok(dataset) => println!("{} channels, {} trials", dataset.num_channels(), dataset.num_trials()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<Dataset, FileError> {
    reader::load_file(file_path)
}

/// Saves a dataset to a container file.
pub fn save<P: AsRef<Path>>(dataset: &Dataset, file_path: P) -> Result<(), FileError> {
    reader::save_file(dataset, file_path)
}

/// Loads two or more container files and merges them.
///
/// # Examples
///
/// ```no_run
/// use recording_merge::{load_and_merge, MergeConfig};
///
/// let merged = load_and_merge(&["run1.trm", "run2.trm"], &MergeConfig::default()).unwrap();
/// println!("Merged into {} trials", merged.num_trials());
/// ```
pub fn load_and_merge<P: AsRef<Path>>(
    file_paths: &[P],
    config: &MergeConfig,
) -> Result<Dataset, FileError> {
    reader::load_and_merge_files(file_paths, config)
}
