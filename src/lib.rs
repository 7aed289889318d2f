//! k-nearest-neighbour classification evaluated by stratified k-fold
//! cross-validation.
//!
//! Labelled records are grouped into a [`Dataset`], split into stratified
//! folds by [`partition`], classified one held-out fold at a time by
//! [`classify_all`] and tallied into a [`ConfusionMatrix`]. The
//! [`cross_validate`] entry-point runs the whole pipeline from a validated
//! [`CrossValidationConfig`].

use csv::{ReaderBuilder, Trim};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_rand::rand_distr::{Distribution, Normal, Uniform};
use ndarray_rand::RandomExt;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Error type used by operations in this crate.
#[derive(Debug, Error)]
pub enum KnnError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("dimension mismatch: expected {expected} features, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("label '{0}' is not part of the label universe")]
    UnknownLabel(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, KnnError>;

/// A fixed-length numeric feature vector together with its label.
///
/// Two records are equal when their arities match and every feature compares
/// exactly equal. The label does not take part in equality.
#[derive(Debug, Clone)]
pub struct Record {
    features: Array1<f64>,
    label: String,
}

impl Record {
    /// Create a record from its features and label.
    pub fn new(features: Vec<f64>, label: impl Into<String>) -> Self {
        Self {
            features: Array1::from(features),
            label: label.into(),
        }
    }

    /// Number of features carried by the record.
    pub fn arity(&self) -> usize {
        self.features.len()
    }

    pub fn features(&self) -> ArrayView1<'_, f64> {
        self.features.view()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bit pattern of the features, with `-0.0` folded onto `0.0` so the key
    /// agrees with float equality for finite values.
    fn feature_key(&self) -> Vec<u64> {
        self.features.iter().map(|v| (v + 0.0).to_bits()).collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.features == other.features
    }
}

#[derive(Debug, Clone)]
struct LabelGroup {
    label: String,
    records: Vec<Record>,
    duplicates: Vec<Record>,
    seen: HashSet<Vec<u64>>,
}

impl LabelGroup {
    fn new(label: String) -> Self {
        Self {
            label,
            records: Vec::new(),
            duplicates: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

/// Records grouped by label in first-seen order.
///
/// A record whose features equal an already stored record of the *same* label
/// is kept aside as a duplicate and never takes part in cross-validation.
/// Feature-equal records with different labels are both kept.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    groups: Vec<LabelGroup>,
    index: HashMap<String, usize>,
    arity: Option<usize>,
}

impl Dataset {
    /// Build a dataset from records in input order.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut dataset = Self::default();
        for record in records {
            dataset.insert(record)?;
        }
        tracing::debug!(
            unique = dataset.unique_count(),
            duplicates = dataset.duplicate_count(),
            labels = dataset.groups.len(),
            arity = dataset.arity.unwrap_or(0),
            "dataset assembled"
        );
        for (label, count) in dataset.label_counts() {
            tracing::debug!(label, count, "label population");
        }
        Ok(dataset)
    }

    fn insert(&mut self, record: Record) -> Result<()> {
        if record.arity() == 0 {
            return Err(KnnError::InvalidData(
                "records must carry at least one feature".into(),
            ));
        }
        if let Some(expected) = self.arity {
            if expected != record.arity() {
                return Err(KnnError::DimensionMismatch {
                    expected,
                    found: record.arity(),
                });
            }
        } else {
            self.arity = Some(record.arity());
        }
        if record.features.iter().any(|v| !v.is_finite()) {
            return Err(KnnError::InvalidData(format!(
                "record labelled '{}' contains a non-finite feature",
                record.label
            )));
        }

        let slot = match self.index.get(&record.label) {
            Some(&slot) => slot,
            None => {
                self.groups.push(LabelGroup::new(record.label.clone()));
                self.index
                    .insert(record.label.clone(), self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[slot];
        if group.seen.insert(record.feature_key()) {
            group.records.push(record);
        } else {
            group.duplicates.push(record);
        }
        Ok(())
    }

    /// Labels in the order they were first seen.
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups.iter().map(|group| group.label.as_str())
    }

    /// Unique records per label, in label order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> + '_ {
        self.groups
            .iter()
            .map(|group| (group.label.as_str(), group.records.as_slice()))
    }

    pub fn records(&self, label: &str) -> Option<&[Record]> {
        self.index
            .get(label)
            .map(|&slot| self.groups[slot].records.as_slice())
    }

    pub fn duplicates(&self, label: &str) -> Option<&[Record]> {
        self.index
            .get(label)
            .map(|&slot| self.groups[slot].duplicates.as_slice())
    }

    /// Unique record count per label, in label order.
    pub fn label_counts(&self) -> Vec<(&str, usize)> {
        self.iter()
            .map(|(label, records)| (label, records.len()))
            .collect()
    }

    pub fn unique_count(&self) -> usize {
        self.groups.iter().map(|group| group.records.len()).sum()
    }

    pub fn duplicate_count(&self) -> usize {
        self.groups.iter().map(|group| group.duplicates.len()).sum()
    }

    /// Shared feature arity, `None` while the dataset is empty.
    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub fn is_empty(&self) -> bool {
        self.unique_count() == 0
    }
}

/// Distance used to rank candidate neighbours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum DistanceMetric {
    /// Square root of the summed squared differences over every feature.
    #[default]
    Euclidean,
    /// Sum of absolute differences over every feature.
    Manhattan,
    /// Euclidean distance over a configured subset of feature indices.
    ///
    /// Records that differ only outside the subset are at distance zero.
    CorrectedEuclidean { features: Vec<usize> },
}

impl DistanceMetric {
    /// Distance between two records of equal arity.
    pub fn distance(&self, a: &Record, b: &Record) -> Result<f64> {
        if a.arity() != b.arity() {
            return Err(KnnError::DimensionMismatch {
                expected: a.arity(),
                found: b.arity(),
            });
        }
        let (a, b) = (a.features(), b.features());
        match self {
            DistanceMetric::Euclidean => Ok(squared_distance(&a, &b).sqrt()),
            DistanceMetric::Manhattan => Ok(a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).abs())
                .sum::<f64>()),
            DistanceMetric::CorrectedEuclidean { features } => {
                let mut sum = 0.0;
                for &idx in features {
                    let (Some(x), Some(y)) = (a.get(idx), b.get(idx)) else {
                        return Err(KnnError::InvalidConfig(format!(
                            "feature index {idx} is out of range for arity {}",
                            a.len()
                        )));
                    };
                    let diff = x - y;
                    sum += diff * diff;
                }
                Ok(sum.sqrt())
            }
        }
    }

    /// Check metric parameters against the dataset arity.
    pub fn validate(&self, arity: usize) -> Result<()> {
        let DistanceMetric::CorrectedEuclidean { features } = self else {
            return Ok(());
        };
        if features.is_empty() {
            return Err(KnnError::InvalidConfig(
                "corrected-euclidean needs at least one feature index".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(features.len());
        for &idx in features {
            if idx >= arity {
                return Err(KnnError::InvalidConfig(format!(
                    "corrected-euclidean feature index {idx} is out of range for {arity} features"
                )));
            }
            if !seen.insert(idx) {
                return Err(KnnError::InvalidConfig(format!(
                    "corrected-euclidean feature index {idx} is listed twice"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => write!(f, "euclidean"),
            DistanceMetric::Manhattan => write!(f, "manhattan"),
            DistanceMetric::CorrectedEuclidean { features } => {
                let joined: Vec<String> = features.iter().map(|idx| idx.to_string()).collect();
                write!(f, "corrected-euclidean:{}", joined.join(","))
            }
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = KnnError;

    /// Accepts `euclidean`, `manhattan`, `corrected-euclidean` and
    /// `corrected-euclidean:0,1,10`.
    fn from_str(s: &str) -> Result<Self> {
        let normalised = s.trim().to_lowercase();
        let (name, params) = match normalised.split_once(':') {
            Some((name, params)) => (name.trim(), Some(params)),
            None => (normalised.as_str(), None),
        };
        match (name, params) {
            ("euclidean", None) => Ok(Self::Euclidean),
            ("manhattan", None) => Ok(Self::Manhattan),
            ("corrected-euclidean" | "corrected", params) => {
                let features = match params {
                    Some(list) => parse_indices(list)?,
                    None => Vec::new(),
                };
                Ok(Self::CorrectedEuclidean { features })
            }
            _ => Err(KnnError::InvalidConfig(format!(
                "unsupported distance metric '{s}'"
            ))),
        }
    }
}

fn parse_indices(list: &str) -> Result<Vec<usize>> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>().map_err(|err| {
                KnnError::InvalidConfig(format!("invalid feature index '{part}': {err}"))
            })
        })
        .collect()
}

/// How held-out records are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Classify every held-out record on the calling thread.
    Sequential,
    /// Spread held-out records over the rayon pool and merge partial matrices.
    #[default]
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = KnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "serial" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(KnnError::InvalidConfig(format!(
                "unsupported execution mode '{other}'"
            ))),
        }
    }
}

/// Configurable knobs for a cross-validation run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrossValidationConfig {
    /// Number of stratified folds.
    pub folds: usize,
    /// Number of nearest neighbours taking part in each vote.
    pub neighbors: usize,
    /// Distance used to rank neighbours.
    pub metric: DistanceMetric,
    /// Sequential or rayon-backed classification.
    pub mode: ExecutionMode,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            folds: 10,
            neighbors: 1,
            metric: DistanceMetric::default(),
            mode: ExecutionMode::default(),
        }
    }
}

impl CrossValidationConfig {
    /// Validate configuration parameters for a specific dataset.
    ///
    /// Every fold must leave at least `neighbors` training records once it is
    /// held out; a run that would vote over fewer neighbours is rejected here
    /// instead of silently shrinking `k`.
    pub fn validate(&self, dataset: &Dataset) -> Result<()> {
        let Some(arity) = dataset.arity().filter(|_| !dataset.is_empty()) else {
            return Err(KnnError::InvalidConfig(
                "dataset contains no records".into(),
            ));
        };
        if self.folds == 0 {
            return Err(KnnError::InvalidConfig(
                "folds must be greater than zero".into(),
            ));
        }
        if self.neighbors == 0 {
            return Err(KnnError::InvalidConfig(
                "neighbors must be greater than zero".into(),
            ));
        }
        self.metric.validate(arity)?;

        let total = dataset.unique_count();
        for (fold, size) in fold_sizes(dataset, self.folds).into_iter().enumerate() {
            let available = total - size;
            if available < self.neighbors {
                return Err(KnnError::InvalidConfig(format!(
                    "holding out fold {fold} leaves {available} training records but neighbors = {}; \
                     decrease neighbors or the fold count",
                    self.neighbors
                )));
            }
        }
        Ok(())
    }
}

/// One stratified slice of the dataset, held out once as the test set.
#[derive(Debug, Clone, Default)]
pub struct Fold<'a> {
    records: Vec<&'a Record>,
}

impl<'a> Fold<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[&'a Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Record> + '_ {
        self.records.iter().copied()
    }

    /// Number of records in the fold carrying `label`.
    pub fn label_count(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.label() == label)
            .count()
    }
}

/// Half-open slice of a label's records assigned to fold `fold`.
fn fold_bounds(len: usize, folds: usize, fold: usize) -> (usize, usize) {
    (len * fold / folds, len * (fold + 1) / folds)
}

/// Fold sizes `partition` would produce, without materialising the folds.
pub fn fold_sizes(dataset: &Dataset, folds: usize) -> Vec<usize> {
    if folds == 0 {
        return Vec::new();
    }
    (0..folds)
        .map(|fold| {
            dataset
                .iter()
                .map(|(_, records)| {
                    let (start, end) = fold_bounds(records.len(), folds, fold);
                    end - start
                })
                .sum()
        })
        .collect()
}

/// Split every label's records into `folds` contiguous, non-overlapping slices.
///
/// Fold `i` takes indices `[L*i/k, L*(i+1)/k)` of a label with `L` records, so
/// per-label fold sizes differ by at most one and sum to `L`. Folds are filled
/// label by label and keep each label's record order. Duplicates are excluded.
pub fn partition(dataset: &Dataset, folds: usize) -> Result<Vec<Fold<'_>>> {
    if folds == 0 {
        return Err(KnnError::InvalidConfig(
            "folds must be greater than zero".into(),
        ));
    }
    if dataset.is_empty() {
        return Err(KnnError::InvalidConfig(
            "dataset contains no records".into(),
        ));
    }

    let mut out: Vec<Fold<'_>> = (0..folds).map(|_| Fold::default()).collect();
    for (_, records) in dataset.iter() {
        for (idx, fold) in out.iter_mut().enumerate() {
            let (start, end) = fold_bounds(records.len(), folds, idx);
            fold.records.extend(records[start..end].iter());
        }
    }

    debug_assert_eq!(
        out.iter().map(Fold::len).sum::<usize>(),
        dataset.unique_count()
    );
    for (idx, fold) in out.iter().enumerate() {
        tracing::debug!(fold = idx, size = fold.len(), "fold assembled");
    }
    Ok(out)
}

/// Predicted label for one held-out record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction<'a> {
    pub actual: &'a str,
    pub predicted: &'a str,
}

/// Majority label among `labels`.
///
/// Ties go to the label whose first occurrence comes earliest in `labels`.
/// Returns `None` for an empty input.
pub fn majority_vote<'a, I>(labels: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tally: Vec<(&'a str, usize)> = Vec::new();
    for label in labels {
        match tally.iter_mut().find(|entry| entry.0 == label) {
            Some(entry) => entry.1 += 1,
            None => tally.push((label, 1)),
        }
    }

    let mut best: Option<(&'a str, usize)> = None;
    for (label, count) in tally {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label)
}

/// Rank `candidates` by distance to `query` and vote among the closest `k`.
///
/// Candidates at equal distance keep their scan order.
pub fn predict<'a, I>(
    query: &Record,
    candidates: I,
    k: usize,
    metric: &DistanceMetric,
) -> Result<&'a str>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut scored = candidates
        .into_iter()
        .map(|candidate| {
            metric
                .distance(query, candidate)
                .map(|distance| (distance, candidate.label()))
        })
        .collect::<Result<Vec<(f64, &'a str)>>>()?;
    scored.sort_by(|(a, _), (b, _)| a.total_cmp(b));

    majority_vote(scored.iter().take(k).map(|&(_, label)| label)).ok_or_else(|| {
        KnnError::InvalidConfig("no training records available to vote on".into())
    })
}

fn classify_held_out<'a>(
    folds: &[Fold<'a>],
    held_out: usize,
    query: &'a Record,
    k: usize,
    metric: &DistanceMetric,
) -> Result<Prediction<'a>> {
    let candidates = folds
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != held_out)
        .flat_map(|(_, fold)| fold.iter());
    let predicted = predict(query, candidates, k, metric)?;
    Ok(Prediction {
        actual: query.label(),
        predicted,
    })
}

/// Leave-one-fold-out classification of every record in `folds`.
///
/// Predictions come back in fold order, then record order within a fold,
/// regardless of `mode`. The first metric error aborts the run.
pub fn classify_all<'a>(
    folds: &[Fold<'a>],
    k: usize,
    metric: &DistanceMetric,
    mode: ExecutionMode,
) -> Result<Vec<Prediction<'a>>> {
    if k == 0 {
        return Err(KnnError::InvalidConfig(
            "neighbors must be greater than zero".into(),
        ));
    }

    match mode {
        ExecutionMode::Sequential => {
            let mut out = Vec::with_capacity(folds.iter().map(Fold::len).sum());
            for (held_out, fold) in folds.iter().enumerate() {
                for query in fold.iter() {
                    out.push(classify_held_out(folds, held_out, query, k, metric)?);
                }
            }
            Ok(out)
        }
        ExecutionMode::Parallel => {
            let queries: Vec<(usize, &'a Record)> = folds
                .iter()
                .enumerate()
                .flat_map(|(held_out, fold)| fold.iter().map(move |query| (held_out, query)))
                .collect();
            queries
                .par_iter()
                .map(|&(held_out, query)| classify_held_out(folds, held_out, query, k, metric))
                .collect()
        }
    }
}

/// Counts of actual (rows) against predicted (columns) labels.
///
/// The label universe is sorted, and every pair starts at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    labels: Vec<String>,
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Create an all-zero matrix over `labels`.
    pub fn new<L, S>(labels: L) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        let n = labels.len();
        Self {
            labels,
            counts: Array2::zeros((n, n)),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn position(&self, label: &str) -> Result<usize> {
        self.labels
            .binary_search_by(|probe| probe.as_str().cmp(label))
            .map_err(|_| KnnError::UnknownLabel(label.to_string()))
    }

    /// Count one verdict.
    pub fn record(&mut self, actual: &str, predicted: &str) -> Result<()> {
        let row = self.position(actual)?;
        let col = self.position(predicted)?;
        self.counts[(row, col)] += 1;
        Ok(())
    }

    pub fn get(&self, actual: &str, predicted: &str) -> Option<u64> {
        let row = self.position(actual).ok()?;
        let col = self.position(predicted).ok()?;
        Some(self.counts[(row, col)])
    }

    /// Add another matrix over the same label universe into this one.
    pub fn merge(&mut self, other: &ConfusionMatrix) -> Result<()> {
        if self.labels != other.labels {
            return Err(KnnError::InvalidData(
                "cannot merge confusion matrices over different label sets".into(),
            ));
        }
        self.counts += &other.counts;
        Ok(())
    }

    /// Counts as rows of actual labels, for serialisation.
    pub fn rows(&self) -> Vec<Vec<u64>> {
        self.counts.outer_iter().map(|row| row.to_vec()).collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Sum of the diagonal.
    pub fn correct(&self) -> u64 {
        self.counts.diag().sum()
    }

    pub fn incorrect(&self) -> u64 {
        self.total() - self.correct()
    }

    /// Percentage of correct verdicts in `[0, 100]`; `0.0` for an empty matrix.
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64 * 100.0
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label_width = self.labels.iter().map(String::len).max().unwrap_or(0);
        let digits = self
            .counts
            .iter()
            .max()
            .map(|max| max.to_string().len())
            .unwrap_or(1)
            .max(3);
        let cell = digits.max(label_width);

        write!(f, "{:width$}  ", "", width = label_width)?;
        for label in &self.labels {
            write!(f, " {label:>cell$}")?;
        }
        writeln!(f)?;

        for (label, row) in self.labels.iter().zip(self.counts.outer_iter()) {
            write!(f, "{label:>label_width$}: ")?;
            for count in row.iter() {
                let padded = format!("{count:0>digits$}");
                write!(f, " {padded:>cell$}")?;
            }
            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Wrong: {}", self.incorrect())?;
        writeln!(f, "Right: {}", self.correct())?;
        write!(f, "Accuracy: {:.2}%", self.accuracy())
    }
}

/// Tally predictions into a confusion matrix over `labels`.
///
/// In parallel mode each rayon worker fills its own matrix and the partial
/// matrices are summed.
pub fn accumulate<L, S>(
    labels: L,
    predictions: &[Prediction<'_>],
    mode: ExecutionMode,
) -> Result<ConfusionMatrix>
where
    L: IntoIterator<Item = S>,
    S: Into<String>,
{
    let empty = ConfusionMatrix::new(labels);
    match mode {
        ExecutionMode::Sequential => {
            let mut matrix = empty;
            for prediction in predictions {
                matrix.record(prediction.actual, prediction.predicted)?;
            }
            Ok(matrix)
        }
        ExecutionMode::Parallel => predictions
            .par_iter()
            .try_fold(
                || empty.clone(),
                |mut acc, prediction| -> Result<ConfusionMatrix> {
                    acc.record(prediction.actual, prediction.predicted)?;
                    Ok(acc)
                },
            )
            .try_reduce(
                || empty.clone(),
                |mut left, right| -> Result<ConfusionMatrix> {
                    left.merge(&right)?;
                    Ok(left)
                },
            ),
    }
}

/// Outcome of [`cross_validate`].
#[derive(Debug, Clone)]
pub struct CrossValidationRun {
    /// Actual against predicted counts over every unique record.
    pub matrix: ConfusionMatrix,
    /// Number of records in each fold.
    pub fold_sizes: Vec<usize>,
    /// Number of classified records.
    pub classified: usize,
}

/// Validate `config`, partition `dataset`, classify every fold and tally.
pub fn cross_validate(
    dataset: &Dataset,
    config: &CrossValidationConfig,
) -> Result<CrossValidationRun> {
    config.validate(dataset)?;
    tracing::info!(
        folds = config.folds,
        neighbors = config.neighbors,
        metric = %config.metric,
        mode = %config.mode,
        records = dataset.unique_count(),
        "starting cross-validation"
    );

    let folds = partition(dataset, config.folds)?;
    let fold_sizes: Vec<usize> = folds.iter().map(Fold::len).collect();
    let predictions = classify_all(&folds, config.neighbors, &config.metric, config.mode)?;
    let matrix = accumulate(dataset.labels(), &predictions, config.mode)?;

    tracing::info!(
        correct = matrix.correct(),
        incorrect = matrix.incorrect(),
        accuracy = matrix.accuracy(),
        "cross-validation finished"
    );
    Ok(CrossValidationRun {
        matrix,
        fold_sizes,
        classified: predictions.len(),
    })
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Generate a labelled dataset of Gaussian blobs around uniform centres.
///
/// Label `i` is named `label-i`; centres are drawn from `[0, 10)^dim`.
pub fn generate_labeled_points(
    labels: usize,
    per_label: usize,
    dim: usize,
    spread: f64,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<Record>> {
    if dim == 0 {
        return Err(KnnError::InvalidConfig(
            "dim must be greater than zero".into(),
        ));
    }
    if !(spread.is_finite() && spread >= 0.0) {
        return Err(KnnError::InvalidConfig(format!(
            "spread must be a finite, non-negative value, got {spread}"
        )));
    }
    let normal = Normal::new(0.0, spread)
        .map_err(|err| KnnError::InvalidConfig(format!("invalid spread {spread}: {err}")))?;
    let centres: Array2<f64> = Array2::random_using((labels, dim), Uniform::new(0.0, 10.0), rng);

    let mut records = Vec::with_capacity(labels * per_label);
    for (label_idx, centre) in centres.outer_iter().enumerate() {
        for _ in 0..per_label {
            let mut features = Vec::with_capacity(dim);
            for &value in centre.iter() {
                features.push(value + normal.sample(rng));
            }
            records.push(Record::new(features, format!("label-{label_idx}")));
        }
    }
    Ok(records)
}

/// Loads labelled records from CSV or Parquet; the last column is the label.
pub struct DataLoader;

impl DataLoader {
    /// Load a CSV file whose first line is a header.
    ///
    /// Fields are separated by `;` when the header contains one and by `,`
    /// otherwise. Every column but the last must parse as `f64`.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Record>> {
        let contents = std::fs::read_to_string(path)?;
        let header = contents.lines().next().unwrap_or_default();
        let delimiter = if header.contains(';') { b';' } else { b',' };

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(contents.as_bytes());
        let mut records = Vec::new();
        let mut width = None;
        for row in rdr.records() {
            let row = row?;
            if let Some(expected) = width {
                if expected != row.len() {
                    return Err(KnnError::InvalidData(format!(
                        "found inconsistent row width: expected {expected}, got {}",
                        row.len()
                    )));
                }
            } else {
                width = Some(row.len());
            }
            let Some(label) = row.iter().last().filter(|_| row.len() >= 2) else {
                return Err(KnnError::InvalidData(
                    "rows need at least one feature column and a label column".into(),
                ));
            };
            let features = row
                .iter()
                .take(row.len() - 1)
                .map(str::parse::<f64>)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            records.push(Record::new(features, label));
        }
        tracing::debug!(rows = records.len(), delimiter = %(delimiter as char), "parsed csv input");
        Ok(records)
    }

    /// Load a Parquet file with numeric feature columns and a trailing label column.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<Record>> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let rows = reader
            .get_row_iter(None)?
            .collect::<std::result::Result<Vec<Row>, _>>()?;
        let Some(width) = rows.first().map(Row::len) else {
            return Ok(Vec::new());
        };
        if width < 2 {
            return Err(KnnError::InvalidData(
                "rows need at least one feature column and a label column".into(),
            ));
        }

        let mut records = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(KnnError::InvalidData(format!(
                    "row {i} width mismatch: expected {width}, found {}",
                    row.len()
                )));
            }
            let mut features = Vec::with_capacity(width - 1);
            let mut label = String::new();
            for (j, (_, field)) in row.get_column_iter().enumerate() {
                if j + 1 == width {
                    label = field_label(field, j)?;
                } else {
                    features.push(field_value(field, j)?);
                }
            }
            records.push(Record::new(features, label));
        }
        Ok(records)
    }
}

fn field_value(field: &Field, column: usize) -> Result<f64> {
    let value = match field {
        Field::Double(v) => *v,
        Field::Float(v) => *v as f64,
        Field::Int(v) => *v as f64,
        Field::Long(v) => *v as f64,
        Field::Short(v) => *v as f64,
        Field::Byte(v) => *v as f64,
        Field::UInt(v) => *v as f64,
        Field::ULong(v) => *v as f64,
        Field::UShort(v) => *v as f64,
        Field::UByte(v) => *v as f64,
        Field::Null => {
            return Err(KnnError::InvalidData(format!(
                "column {column} contained a NULL value which cannot be converted to f64"
            )))
        }
        other => {
            return Err(KnnError::InvalidData(format!(
                "unsupported parquet field at column {column}: {other:?}"
            )))
        }
    };
    Ok(value)
}

fn field_label(field: &Field, column: usize) -> Result<String> {
    let label = match field {
        Field::Str(v) => v.clone(),
        Field::Bool(v) => v.to_string(),
        Field::Int(v) => v.to_string(),
        Field::Long(v) => v.to_string(),
        Field::Short(v) => v.to_string(),
        Field::Byte(v) => v.to_string(),
        Field::UInt(v) => v.to_string(),
        Field::ULong(v) => v.to_string(),
        Field::UShort(v) => v.to_string(),
        Field::UByte(v) => v.to_string(),
        Field::Double(v) => v.to_string(),
        Field::Float(v) => v.to_string(),
        Field::Null => {
            return Err(KnnError::InvalidData(format!(
                "label column {column} contained a NULL value"
            )))
        }
        other => {
            return Err(KnnError::InvalidData(format!(
                "unsupported parquet label at column {column}: {other:?}"
            )))
        }
    };
    Ok(label)
}
