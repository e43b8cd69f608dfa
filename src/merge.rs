use ndarray::{concatenate, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::types::*;

/// Global channel label set and where each input realizes each label.
///
/// Rows follow the first-occurrence order of labels across the inputs,
/// columns follow the input order. Cell `(row, column)` holds the 0-based
/// channel position of the label within that input, or `None` when the
/// input lacks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelIndex {
    labels: Vec<String>,
    positions: Array2<Option<usize>>,
}

impl LabelIndex {
    /// Builds the index from scratch for a set of datasets.
    ///
    /// Labels are matched by exact string comparison. Fails with
    /// `MergeError::DuplicateLabel` when an input repeats a label, since its
    /// position would be ambiguous.
    pub fn build(datasets: &[Dataset]) -> Result<Self, MergeError> {
        let mut labels: Vec<String> = Vec::new();
        let mut rows: HashMap<&str, usize> = HashMap::new();

        for (position, dataset) in datasets.iter().enumerate() {
            let mut own = HashSet::with_capacity(dataset.labels.len());
            for label in &dataset.labels {
                if !own.insert(label.as_str()) {
                    return Err(MergeError::DuplicateLabel {
                        dataset: position,
                        label: label.clone(),
                    });
                }
                if !rows.contains_key(label.as_str()) {
                    rows.insert(label.as_str(), labels.len());
                    labels.push(label.clone());
                }
            }
        }

        let mut positions = Array2::from_elem((labels.len(), datasets.len()), None);
        for (column, dataset) in datasets.iter().enumerate() {
            for (channel, label) in dataset.labels.iter().enumerate() {
                if let Some(&row) = rows.get(label.as_str()) {
                    positions[[row, column]] = Some(channel);
                }
            }
        }

        Ok(LabelIndex { labels, positions })
    }

    /// Returns the global labels in row order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Returns the label-index matrix (labels × datasets).
    pub fn positions(&self) -> ArrayView2<'_, Option<usize>> {
        self.positions.view()
    }

    /// Returns the number of global labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns true when no input has any channel.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the number of indexed datasets.
    pub fn num_datasets(&self) -> usize {
        self.positions.ncols()
    }

    /// Returns the number of labels present in every dataset.
    pub fn shared_rows(&self) -> usize {
        let n = self.num_datasets();
        self.positions
            .rows()
            .into_iter()
            .filter(|row| coverage(row) == n)
            .count()
    }

    /// Restricts the index to the labels present in every dataset.
    pub fn pruned(&self) -> LabelIndex {
        let n = self.num_datasets();
        let keep: Vec<usize> = self
            .positions
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(_, row)| coverage(row) == n)
            .map(|(row, _)| row)
            .collect();

        LabelIndex {
            labels: keep.iter().map(|&row| self.labels[row].clone()).collect(),
            positions: self.positions.select(Axis(0), &keep),
        }
    }

    /// Returns, for each row, the channel position of that label in one dataset.
    ///
    /// Applying this order to the dataset's channel axis puts its channels in
    /// row order. Fails if the dataset lacks any indexed label.
    pub fn channel_order(&self, column: usize) -> Result<Vec<usize>, MergeError> {
        self.positions
            .column(column)
            .iter()
            .zip(&self.labels)
            .map(|(&cell, label)| {
                cell.ok_or_else(|| MergeError::InconsistentLabels {
                    reason: format!("label '{}' is missing from dataset {}", label, column),
                })
            })
            .collect()
    }

    fn width(&self, column: usize) -> usize {
        coverage(&self.positions.column(column))
    }
}

fn coverage(cells: &ArrayView1<'_, Option<usize>>) -> usize {
    cells.iter().filter(|cell| cell.is_some()).count()
}

/// Boolean summary of a label index and the merge mode it implies.
///
/// The mode follows a fixed decision table, evaluated top to bottom:
///
/// | shared | disjoint | single channel | mode |
/// |--------|----------|----------------|------|
/// | yes    | yes      | any            | ambiguous |
/// | no     | yes      | yes            | ambiguous |
/// | yes    | no       | any            | trial concatenation |
/// | no     | yes      | no             | channel concatenation |
/// | no     | no       | any            | inconsistent |
///
/// Single-channel inputs with distinct labels are ambiguous: they could be
/// extra channels or more trials of one channel recorded under other names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Some label is present in every dataset
    pub labels_shared: bool,
    /// Every label is present in exactly one dataset
    pub labels_disjoint: bool,
    /// Every dataset has exactly one channel
    pub single_channel: bool,
    /// Datasets present their channels in different orders
    pub needs_reorder: bool,
    /// Some labels are missing from at least one dataset
    pub needs_prune: bool,
    /// Mode inferred from the labels alone
    pub mode: MergeMode,
}

/// Classifies a label index into a merge mode.
pub fn classify(index: &LabelIndex) -> Classification {
    let n = index.num_datasets();
    let positions = index.positions();
    let shared_rows = index.shared_rows();

    let labels_shared = shared_rows > 0;
    let labels_disjoint =
        !index.is_empty() && positions.rows().into_iter().all(|row| coverage(&row) == 1);
    let single_channel = (0..n).all(|column| index.width(column) == 1);

    let needs_reorder =
        labels_shared && (1..n).any(|column| positions.column(column) != positions.column(0));
    let needs_prune = labels_shared && shared_rows < index.len();

    let mode = match (labels_shared, labels_disjoint, single_channel) {
        (true, true, _) => MergeMode::Unresolvable(Unresolvable::Ambiguous),
        (false, true, true) => MergeMode::Unresolvable(Unresolvable::Ambiguous),
        (true, false, _) => MergeMode::TrialConcat,
        (false, true, false) => MergeMode::ChannelConcat,
        (false, false, _) => MergeMode::Unresolvable(Unresolvable::Inconsistent),
    };

    Classification {
        labels_shared,
        labels_disjoint,
        single_channel,
        needs_reorder,
        needs_prune,
        mode,
    }
}

impl Classification {
    /// Picks the merge mode for the requested dimension.
    ///
    /// `Auto` takes the inferred mode. An explicit dimension skips the
    /// ambiguity rule but still needs its structural condition to hold.
    pub fn resolve(&self, dimension: MergeDimension) -> Result<MergeMode, MergeError> {
        match dimension {
            MergeDimension::Auto => match self.mode {
                MergeMode::Unresolvable(reason) => Err(self.unresolved(reason)),
                mode => Ok(mode),
            },
            MergeDimension::Trials if self.labels_shared => Ok(MergeMode::TrialConcat),
            MergeDimension::Trials => Err(MergeError::InconsistentLabels {
                reason: "no channel label is present in every dataset".to_string(),
            }),
            MergeDimension::Channels if self.labels_disjoint => Ok(MergeMode::ChannelConcat),
            MergeDimension::Channels => Err(MergeError::InconsistentLabels {
                reason: "some channel label is present in more than one dataset".to_string(),
            }),
        }
    }

    fn unresolved(&self, reason: Unresolvable) -> MergeError {
        match reason {
            Unresolvable::Ambiguous if self.labels_shared => MergeError::AmbiguousMerge {
                reason: "every label belongs to a single dataset, yet some label is in all of them"
                    .to_string(),
            },
            Unresolvable::Ambiguous => MergeError::AmbiguousMerge {
                reason: "every dataset holds a single channel under a different label"
                    .to_string(),
            },
            Unresolvable::Inconsistent => MergeError::InconsistentLabels {
                reason: "no label is present in every dataset and not every label is unique to \
                         one dataset"
                    .to_string(),
            },
        }
    }
}

/// Merges two or more datasets into one.
///
/// The merge mode is inferred from the channel labels (or taken from
/// `config.dimension`). Trial concatenation reorders every input to a common
/// channel order, dropping channels not present in all inputs, and returns
/// the channels in the first input's order. Channel concatenation requires
/// equal trial counts and identical time axes.
///
/// Inputs are never modified; the result carries a `Provenance` record of
/// the inputs.
///
/// # Examples
///
/// ```
/// use ndarray::{Array1, Array2};
/// use recording_merge::{merge, Dataset, MergeConfig};
///
/// let session = |trials: usize| {
///     Dataset::new(
///         vec!["A".to_string(), "B".to_string()],
///         vec![Array2::zeros((2, 10)); trials],
///         vec![Array1::range(0.0, 10.0, 1.0); trials],
///     )
///     .unwrap()
/// };
///
/// let merged = merge(&[session(2), session(3)], &MergeConfig::default()).unwrap();
/// assert_eq!(merged.labels, vec!["A", "B"]);
/// assert_eq!(merged.num_trials(), 5);
/// ```
pub fn merge(datasets: &[Dataset], config: &MergeConfig) -> Result<Dataset, MergeError> {
    if datasets.len() < 2 {
        return Err(MergeError::InsufficientInput(datasets.len()));
    }
    for (position, dataset) in datasets.iter().enumerate() {
        dataset.validate(position)?;
    }

    let index = LabelIndex::build(datasets)?;
    let classification = classify(&index);
    let mode = classification.resolve(config.dimension)?;

    debug!(
        datasets = datasets.len(),
        labels = index.len(),
        ?mode,
        reorder = classification.needs_reorder,
        prune = classification.needs_prune,
        "classified merge"
    );

    let mut merged = match mode {
        MergeMode::TrialConcat => {
            let mut merged = merge_trials(datasets, index, &classification)?;
            merged.trial_definition = stack_trial_definitions(datasets)?;
            merged
        }
        MergeMode::ChannelConcat => concat_channels(datasets)?,
        MergeMode::Unresolvable(reason) => return Err(classification.unresolved(reason)),
    };

    merged.provenance = Some(Provenance {
        mode,
        sources: datasets
            .iter()
            .enumerate()
            .map(|(position, dataset)| SourceRecord::from_dataset(position, dataset))
            .collect(),
    });

    debug!(
        channels = merged.num_channels(),
        trials = merged.num_trials(),
        "merge complete"
    );

    Ok(merged)
}

fn merge_trials(
    datasets: &[Dataset],
    index: LabelIndex,
    classification: &Classification,
) -> Result<Dataset, MergeError> {
    if !classification.needs_reorder {
        return Ok(concat_trials(datasets[0].labels.clone(), datasets));
    }

    let index = if classification.needs_prune {
        let pruned = index.pruned();
        let dropped: Vec<&String> = index
            .labels()
            .iter()
            .filter(|label| !pruned.labels().contains(*label))
            .collect();
        warn!(
            ?dropped,
            kept = pruned.len(),
            "dropping channels not present in every dataset"
        );
        pruned
    } else {
        index
    };

    let aligned = datasets
        .iter()
        .enumerate()
        .map(|(column, dataset)| -> Result<Dataset, MergeError> {
            Ok(permute_channels(dataset, &index.channel_order(column)?))
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(channels = index.len(), "reordered inputs to common channel order");

    let merged = concat_trials(index.labels().to_vec(), &aligned);
    Ok(restore_order(&merged, &index.channel_order(0)?))
}

/// Applies a channel permutation, returning a new dataset.
///
/// Output channel `k` is input channel `order[k]`.
pub(crate) fn permute_channels(dataset: &Dataset, order: &[usize]) -> Dataset {
    Dataset {
        name: dataset.name.clone(),
        labels: order.iter().map(|&i| dataset.labels[i].clone()).collect(),
        trials: dataset
            .trials
            .iter()
            .map(|block| block.select(Axis(0), order))
            .collect(),
        time_axes: dataset.time_axes.clone(),
        trial_definition: dataset.trial_definition.clone(),
        provenance: dataset.provenance.clone(),
    }
}

/// Puts channels back in the first input's order.
///
/// `original_positions[row]` is where the channel now at `row` sat in the
/// first input.
pub(crate) fn restore_order(merged: &Dataset, original_positions: &[usize]) -> Dataset {
    let mut order: Vec<usize> = (0..original_positions.len()).collect();
    order.sort_by_key(|&row| original_positions[row]);
    debug!(?order, "restoring first dataset channel order");
    permute_channels(merged, &order)
}

fn concat_trials<'a>(
    labels: Vec<String>,
    datasets: impl IntoIterator<Item = &'a Dataset>,
) -> Dataset {
    let mut trials = Vec::new();
    let mut time_axes = Vec::new();
    for dataset in datasets {
        trials.extend(dataset.trials.iter().cloned());
        time_axes.extend(dataset.time_axes.iter().cloned());
    }

    Dataset {
        name: None,
        labels,
        trials,
        time_axes,
        trial_definition: None,
        provenance: None,
    }
}

fn concat_channels(datasets: &[Dataset]) -> Result<Dataset, MergeError> {
    let reference = &datasets[0];

    for (position, dataset) in datasets.iter().enumerate().skip(1) {
        if dataset.num_trials() != reference.num_trials() {
            return Err(MergeError::TrialCountMismatch {
                dataset: position,
                expected: reference.num_trials(),
                found: dataset.num_trials(),
            });
        }
        for (trial, (axis, reference_axis)) in
            dataset.time_axes.iter().zip(&reference.time_axes).enumerate()
        {
            // Exact comparison; an axis holding NaN never matches
            if axis != reference_axis {
                return Err(MergeError::TimeAxisMismatch {
                    dataset: position,
                    trial,
                });
            }
        }
    }

    let trials = (0..reference.num_trials())
        .map(|trial| {
            let blocks: Vec<ArrayView2<'_, f64>> = datasets
                .iter()
                .map(|dataset| dataset.trials[trial].view())
                .collect();
            concatenate(Axis(0), &blocks)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Dataset {
        name: None,
        labels: datasets
            .iter()
            .flat_map(|dataset| dataset.labels.iter().cloned())
            .collect(),
        trials,
        time_axes: reference.time_axes.clone(),
        trial_definition: None,
        provenance: None,
    })
}

/// Stacks the inputs' trial definitions when every input has one of the same width.
fn stack_trial_definitions(datasets: &[Dataset]) -> Result<Option<Array2<f64>>, MergeError> {
    let definitions: Option<Vec<ArrayView2<'_, f64>>> = datasets
        .iter()
        .map(|dataset| dataset.trial_definition.as_ref().map(|d| d.view()))
        .collect();

    match definitions {
        Some(views) if views.iter().all(|v| v.ncols() == views[0].ncols()) => {
            Ok(Some(concatenate(Axis(0), &views)?))
        }
        Some(_) => {
            debug!("trial definitions differ in width; leaving them in provenance");
            Ok(None)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    // Every sample of a channel holds a code derived from its label, so
    // channel moves can be traced through a merge.
    fn code(label: &str) -> f64 {
        label.bytes().map(f64::from).sum()
    }

    fn dataset(labels: &[&str], trials: usize, samples: usize) -> Dataset {
        let block = Array2::from_shape_fn((labels.len(), samples), |(c, _)| code(labels[c]));
        Dataset::new(
            labels.iter().map(|s| s.to_string()).collect(),
            vec![block; trials],
            vec![Array1::range(0.0, samples as f64, 1.0); trials],
        )
        .unwrap()
    }

    fn assert_rows_match_labels(merged: &Dataset) {
        for block in &merged.trials {
            for (row, label) in block.rows().into_iter().zip(&merged.labels) {
                assert!(row.iter().all(|&v| v == code(label)), "row for {label}");
            }
        }
    }

    #[test]
    fn index_keeps_first_occurrence_order() {
        let index = LabelIndex::build(&[dataset(&["B", "A"], 1, 2), dataset(&["C", "A"], 1, 2)])
            .unwrap();

        assert_eq!(index.labels(), &["B", "A", "C"]);
        assert_eq!(index.positions()[[0, 0]], Some(0));
        assert_eq!(index.positions()[[1, 0]], Some(1));
        assert_eq!(index.positions()[[1, 1]], Some(1));
        assert_eq!(index.positions()[[2, 0]], None);
        assert_eq!(index.positions()[[2, 1]], Some(0));
        assert_eq!(index.shared_rows(), 1);
    }

    #[test]
    fn index_rejects_duplicate_labels() {
        let mut bad = dataset(&["A", "B"], 1, 2);
        bad.labels[1] = "A".to_string();

        let err = LabelIndex::build(&[dataset(&["A"], 1, 2), bad]).unwrap_err();
        assert!(matches!(
            err,
            MergeError::DuplicateLabel { dataset: 1, ref label } if label == "A"
        ));
    }

    #[test]
    fn pruned_index_keeps_shared_rows() {
        let index = LabelIndex::build(&[
            dataset(&["x", "y", "z"], 1, 2),
            dataset(&["z", "x"], 1, 2),
        ])
        .unwrap();
        let pruned = index.pruned();

        assert_eq!(pruned.labels(), &["x", "z"]);
        assert_eq!(pruned.channel_order(0).unwrap(), vec![0, 2]);
        assert_eq!(pruned.channel_order(1).unwrap(), vec![1, 0]);
        assert!(index.channel_order(1).is_err());
    }

    #[test]
    fn identical_labels_classify_as_trial_concat() {
        let index = LabelIndex::build(&[dataset(&["A", "B"], 1, 2), dataset(&["A", "B"], 1, 2)])
            .unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::TrialConcat);
        assert!(!c.needs_reorder);
        assert!(!c.needs_prune);
    }

    #[test]
    fn permuted_labels_need_reorder_only() {
        let index = LabelIndex::build(&[dataset(&["A", "B"], 1, 2), dataset(&["B", "A"], 1, 2)])
            .unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::TrialConcat);
        assert!(c.needs_reorder);
        assert!(!c.needs_prune);
    }

    #[test]
    fn partial_overlap_needs_prune_and_reorder() {
        let index = LabelIndex::build(&[dataset(&["x", "y", "z"], 1, 2), dataset(&["x", "z"], 1, 2)])
            .unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::TrialConcat);
        assert!(c.needs_prune);
        assert!(c.needs_reorder);
    }

    #[test]
    fn disjoint_labels_of_different_width_classify_as_channel_concat() {
        let index =
            LabelIndex::build(&[dataset(&["A", "B"], 1, 2), dataset(&["C"], 1, 2)]).unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::ChannelConcat);
        assert!(c.labels_disjoint);
        assert!(!c.single_channel);
        assert!(!c.needs_reorder);
    }

    #[test]
    fn disjoint_montages_of_equal_width_classify_as_channel_concat() {
        let index = LabelIndex::build(&[
            dataset(&["Fz", "Cz"], 1, 2),
            dataset(&["HEOG", "VEOG"], 1, 2),
        ])
        .unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::ChannelConcat);
        assert!(!c.single_channel);
        assert_eq!(
            c.resolve(MergeDimension::Auto).unwrap(),
            MergeMode::ChannelConcat
        );
    }

    #[test]
    fn single_channel_disjoint_labels_are_ambiguous() {
        let index = LabelIndex::build(&[dataset(&["A"], 1, 2), dataset(&["B"], 1, 2)]).unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::Unresolvable(Unresolvable::Ambiguous));
        assert!(matches!(
            c.resolve(MergeDimension::Auto),
            Err(MergeError::AmbiguousMerge { .. })
        ));
        assert_eq!(
            c.resolve(MergeDimension::Channels).unwrap(),
            MergeMode::ChannelConcat
        );
        assert!(matches!(
            c.resolve(MergeDimension::Trials),
            Err(MergeError::InconsistentLabels { .. })
        ));
    }

    #[test]
    fn chained_overlap_is_inconsistent() {
        let index = LabelIndex::build(&[
            dataset(&["A", "B"], 1, 2),
            dataset(&["B", "C"], 1, 2),
            dataset(&["C", "D"], 1, 2),
        ])
        .unwrap();
        let c = classify(&index);

        assert_eq!(c.mode, MergeMode::Unresolvable(Unresolvable::Inconsistent));
        assert!(matches!(
            c.resolve(MergeDimension::Auto),
            Err(MergeError::InconsistentLabels { .. })
        ));
    }

    #[test]
    fn channelless_inputs_are_inconsistent() {
        let empty = Dataset::new(vec![], vec![Array2::zeros((0, 3))], vec![Array1::zeros(3)])
            .unwrap();
        let c = classify(&LabelIndex::build(&[empty.clone(), empty]).unwrap());

        assert_eq!(c.mode, MergeMode::Unresolvable(Unresolvable::Inconsistent));
    }

    #[test]
    fn forced_channels_rejects_shared_labels() {
        let err = merge(
            &[dataset(&["A", "B"], 1, 4), dataset(&["A", "B"], 1, 4)],
            &MergeConfig {
                dimension: MergeDimension::Channels,
            },
        )
        .unwrap_err();

        assert!(matches!(err, MergeError::InconsistentLabels { .. }));
    }

    #[test]
    fn permute_channels_moves_labels_and_rows() {
        let permuted = permute_channels(&dataset(&["A", "B", "C"], 2, 3), &[2, 0, 1]);

        assert_eq!(permuted.labels, vec!["C", "A", "B"]);
        assert_rows_match_labels(&permuted);
    }

    #[test]
    fn restore_order_sorts_by_original_position() {
        let merged = dataset(&["z", "x"], 1, 2);
        let restored = restore_order(&merged, &[2, 0]);

        assert_eq!(restored.labels, vec!["x", "z"]);
        assert_rows_match_labels(&restored);
    }

    #[test]
    fn reordered_merge_keeps_data_with_its_label() {
        let merged = merge(
            &[dataset(&["A", "B", "C"], 1, 4), dataset(&["C", "A", "B"], 2, 4)],
            &MergeConfig::default(),
        )
        .unwrap();

        assert_eq!(merged.labels, vec!["A", "B", "C"]);
        assert_eq!(merged.num_trials(), 3);
        assert_rows_match_labels(&merged);
    }

    #[test]
    fn channel_concat_rejects_trial_count_mismatch() {
        let err = merge(
            &[dataset(&["A", "B"], 2, 4), dataset(&["C"], 3, 4)],
            &MergeConfig::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            MergeError::TrialCountMismatch {
                dataset: 1,
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn channel_concat_compares_time_axes_exactly() {
        let mut shifted = dataset(&["C"], 2, 4);
        shifted.time_axes[1][0] += 1e-9;

        let err = merge(
            &[dataset(&["A", "B"], 2, 4), shifted],
            &MergeConfig::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            MergeError::TimeAxisMismatch {
                dataset: 1,
                trial: 1
            }
        ));
    }

    #[test]
    fn trial_definitions_are_stacked_for_trial_concat() {
        let a = dataset(&["A"], 2, 3).with_trial_definition(Array2::from_elem((2, 3), 1.0));
        let b = dataset(&["A"], 1, 3).with_trial_definition(Array2::from_elem((1, 3), 2.0));

        let merged = merge(&[a, b], &MergeConfig::default()).unwrap();
        let definition = merged.trial_definition.unwrap();

        assert_eq!(definition.dim(), (3, 3));
        assert_eq!(definition[[2, 0]], 2.0);
    }

    #[test]
    fn trial_definitions_of_different_width_are_dropped() {
        let a = dataset(&["A"], 1, 3).with_trial_definition(Array2::zeros((1, 3)));
        let b = dataset(&["A"], 1, 3).with_trial_definition(Array2::zeros((1, 4)));

        let merged = merge(&[a, b], &MergeConfig::default()).unwrap();

        assert!(merged.trial_definition.is_none());
        let provenance = merged.provenance.unwrap();
        assert_eq!(
            provenance.sources[1].trial_definition.as_ref().map(|d| d.ncols()),
            Some(4)
        );
    }
}
