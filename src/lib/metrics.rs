//! Functionality pertaining to the collection of metrics during demultiplexing.
//!
//! The [`Demultiplexer`](crate::demux::Demultiplexer) fills in a [`DemuxMetrics`] as it runs.
//! It holds the run level [`RunCounters`], one [`SampleMetrics`] per sample (the undetermined
//! sample last), and optionally an [`UnmatchedCounter`] tracking the most frequently seen
//! barcode pairs that did not match any sample.
//!
//! The [`RunCounters`] count reads, not pairs: every decision made for a pair increments a
//! counter by two, one for each mate.  The per-sample metrics count templates (pairs).
//!
//! Live progress is handed to a [`ProgressReporter`], which logs snapshots of the counters on a
//! background thread.
//!
//! All metrics are writable to files.

use std::fmt::Display;
use std::path::Path;
use std::thread::JoinHandle;

use ahash::AHashMap;
use anyhow::{Context, Result};
use bstr::BString;
use fgoxide::io::DelimFile;
use flume::{Receiver, Sender};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{matcher::MatchResult, sample_metadata::SampleMetadata};

/// The max number of counter snapshots waiting to be logged by the [`ProgressReporter`].
pub const DEFAULT_PROGRESS_CHANNEL_SIZE: usize = 8;
/// The max number of keys the hash can retain before re-sizing
pub const DEFAULT_UNMATCHED_MAX_COUNTER_SIZE: usize = 5_000_000;
/// The number of keys to downsize to
pub const DEFAULT_UNMATCHED_DOWNSIZE_TO: usize = 5_000;

/// Helper type for the `INDEX1+INDEX2` form of an observed barcode pair.
type RawBarcode = Vec<u8>;

/// The run level counters.
///
/// Every field is a number of reads and so always grows by two, once per mate.  Every counted
/// pair is charged to exactly one of the outcome counters, see [`RunCounters::is_conserved`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// The number of reads seen.
    pub count: usize,
    /// The number of reads written to a sample.
    #[serde(rename = "match")]
    pub matched: usize,
    /// The number of reads written to the undetermined sample.
    pub undetermined: usize,
    /// The number of reads dropped because the index1 mean quality was too low.
    pub index1_bad_mean: usize,
    /// The number of reads dropped because the index2 mean quality was too low.
    pub index2_bad_mean: usize,
    /// The number of reads dropped because an index1 base quality was too low.
    pub index1_bad_min: usize,
    /// The number of reads dropped because an index2 base quality was too low.
    pub index2_bad_min: usize,
}

impl RunCounters {
    /// Add the counts from another [`RunCounters`] to this one.
    pub fn update_with(&mut self, other: &Self) {
        self.count += other.count;
        self.matched += other.matched;
        self.undetermined += other.undetermined;
        self.index1_bad_mean += other.index1_bad_mean;
        self.index2_bad_mean += other.index2_bad_mean;
        self.index1_bad_min += other.index1_bad_min;
        self.index2_bad_min += other.index2_bad_min;
    }

    /// The number of reads dropped by any of the quality checks.
    pub fn dropped(&self) -> usize {
        self.index1_bad_mean + self.index2_bad_mean + self.index1_bad_min + self.index2_bad_min
    }

    /// True if every read seen has been charged to exactly one outcome.
    pub fn is_conserved(&self) -> bool {
        self.count == self.matched + self.undetermined + self.dropped()
    }
}

impl Display for RunCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "count: {}, match: {}, undetermined: {}, index1_bad_mean: {}, index2_bad_mean: {}, \
             index1_bad_min: {}, index2_bad_min: {}",
            self.count,
            self.matched,
            self.undetermined,
            self.index1_bad_mean,
            self.index2_bad_mean,
            self.index1_bad_min,
            self.index2_bad_min
        )
    }
}

/// Logs snapshots of the [`RunCounters`] on a background thread.
///
/// Reporting never blocks: when the channel is full the snapshot is dropped.
pub struct ProgressReporter {
    /// The join handle for the thread the reporter is running on, returns the number of
    /// snapshots logged.
    handle: Option<JoinHandle<usize>>,
    /// The `Sender` end of the channel to send snapshots to the reporter.
    tx: Option<Sender<RunCounters>>,
}

impl ProgressReporter {
    /// Create a new [`ProgressReporter`], spinning up its thread in the background.
    ///
    /// # Arguments
    /// - `channel_size` - The max number of snapshots waiting to be logged, defaults to [`DEFAULT_PROGRESS_CHANNEL_SIZE`].
    pub fn new(channel_size: Option<usize>) -> Result<Self> {
        let (tx, rx): (Sender<RunCounters>, Receiver<RunCounters>) =
            flume::bounded(channel_size.unwrap_or(DEFAULT_PROGRESS_CHANNEL_SIZE));
        let handle = std::thread::Builder::new()
            .name(String::from("progress"))
            .spawn(move || {
                let mut logged = 0;
                while let Ok(counters) = rx.recv() {
                    info!("Progress: {}", counters);
                    logged += 1;
                }
                logged
            })
            .context("Failed to start the progress reporter thread")?;
        Ok(Self { handle: Some(handle), tx: Some(tx) })
    }

    /// Offer a snapshot of the counters.  Returns false if the snapshot was not accepted.
    pub fn report(&self, counters: &RunCounters) -> bool {
        self.tx.as_ref().map_or(false, |tx| tx.try_send(*counters).is_ok())
    }

    /// Stop the reporter thread once all pending snapshots are logged, returning the number of
    /// snapshots logged.
    pub fn finish(mut self) -> usize {
        drop(self.tx.take());
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(logged)) => logged,
            // If the thread was panicking, resume the panic
            Some(Err(e)) => std::panic::resume_unwind(e),
            None => 0,
        }
    }
}

/// Container for tracking the number of times each unmatched barcode has been seen.
#[derive(Debug)]
pub struct UnmatchedCounter {
    /// The unmatched barcode counter.
    unmatched_counter: AHashMap<RawBarcode, i64>,
    /// The max number of keys that can be held before downsizing.
    max_counter_size: usize,
    /// The number of keys to retain when downsizing.
    downsize_to: usize,
}

impl Default for UnmatchedCounter {
    fn default() -> Self {
        Self::new(DEFAULT_UNMATCHED_MAX_COUNTER_SIZE, DEFAULT_UNMATCHED_DOWNSIZE_TO)
    }
}

impl UnmatchedCounter {
    /// Create a new [`UnmatchedCounter`].
    ///
    /// # Argument
    /// - `max_counter_size` - the max number of keys the internal hashmap can contain before downsizing.
    /// - `downsize_to` - the number of keys to retain when downsizing.
    pub fn new(max_counter_size: usize, downsize_to: usize) -> Self {
        Self { unmatched_counter: AHashMap::new(), max_counter_size, downsize_to }
    }

    /// Count a barcode, downsizing first if the counter is full.
    pub fn insert(&mut self, barcode: &[u8]) {
        if self.unmatched_counter.len() >= self.max_counter_size
            && !self.unmatched_counter.contains_key(barcode)
        {
            self.downsize();
        }
        match self.unmatched_counter.get_mut(barcode) {
            Some(count) => *count += 1,
            None => {
                self.unmatched_counter.insert(barcode.to_vec(), 1);
            }
        }
    }

    /// Downsize the counter to `downsize_to` keys, keeping the most frequent.
    pub fn downsize(&mut self) {
        let new = AHashMap::with_capacity(self.downsize_to);
        let previous = std::mem::replace(&mut self.unmatched_counter, new);
        self.unmatched_counter.extend(
            previous
                .into_iter()
                .sorted_unstable_by_key(|(_k, count)| -count)
                .take(self.downsize_to),
        );
    }

    pub fn len(&self) -> usize {
        self.unmatched_counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unmatched_counter.is_empty()
    }

    /// The top `n` barcodes, most frequent first.  Ties are broken by barcode.
    fn most_frequent(self, n: usize) -> Vec<BarcodeCount> {
        self.unmatched_counter
            .into_iter()
            .sorted_unstable_by(|(b1, c1), (b2, c2)| c2.cmp(c1).then_with(|| b1.cmp(b2)))
            .take(n)
            .map(|(barcode, count)| BarcodeCount::new(barcode.into(), count as isize))
            .collect()
    }

    /// Write the top `n` unmatched barcodes to a `most_frequent_unmatched.tsv` file in the specified directory.
    pub fn to_file<P: AsRef<Path>>(self, output_dir: P, n: usize, prefix: &str) -> Result<()> {
        let filename = [prefix.to_string(), "most_frequent_unmatched.tsv".to_string()].concat();
        let output_path = output_dir.as_ref().join(filename);
        let delim = DelimFile::default();
        delim
            .write_tsv(&output_path, self.most_frequent(n))
            .with_context(|| format!("Failed to write {:?}", output_path))?;
        Ok(())
    }
}

/// The per-sample metrics, counted in templates (read pairs).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SampleMetrics {
    /// The number of templates with perfect barcode matches.
    pub perfect_matches: usize,
    /// The number of templates matched with at least one mismatch.
    pub mismatched_matches: usize,
    /// The total number of templates attributed to this sample.
    pub total_matches: usize,
}

impl SampleMetrics {
    /// Update this [`SampleMetrics`] with another [`SampleMetrics`].
    pub fn update_with(&mut self, other: &Self) {
        self.perfect_matches += other.perfect_matches;
        self.mismatched_matches += other.mismatched_matches;
        self.total_matches += other.total_matches;
    }

    /// Update the match counters with a [`MatchResult`].
    pub fn update_with_match(&mut self, match_result: &MatchResult) {
        if let MatchResult::Match { hamming_dist, .. } = *match_result {
            if hamming_dist == 0 {
                self.perfect_matches += 1;
            } else {
                self.mismatched_matches += 1;
            }
        }
        self.total_matches += 1;
    }

    /// Convert [`SampleMetrics`] into [`SampleMetricsProcessed`].
    fn as_processed(
        &self,
        total_templates: usize,
        best_barcode_template_count: usize,
        sample_metadata: &SampleMetadata,
    ) -> SampleMetricsProcessed {
        SampleMetricsProcessed {
            sample_id: sample_metadata.sample_id.clone(),
            barcode: sample_metadata.barcode_pair(),
            templates: self.total_matches,
            perfect_matches: self.perfect_matches,
            mismatched_matches: self.mismatched_matches,
            fraction_matches: ratio(self.total_matches, total_templates),
            ratio_this_barcode_to_best_barcode: ratio(
                self.total_matches,
                best_barcode_template_count,
            ),
        }
    }
}

/// Ratio of two counts, zero when the denominator is zero.
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// All the metrics collected while demultiplexing.
#[derive(Debug, Default)]
pub struct DemuxMetrics {
    /// The run level counters.
    pub counters: RunCounters,
    /// The per-sample metrics, one per sample with the undetermined sample last.
    pub per_sample_metrics: Vec<SampleMetrics>,
    /// The optional counter of unmatched barcode pairs.
    pub unmatched_counter: Option<UnmatchedCounter>,
}

impl DemuxMetrics {
    /// Create a [`DemuxMetrics`] for the given number of samples (including the undetermined
    /// sample), optionally tracking unmatched barcodes.
    pub fn new(num_samples: usize, unmatched_counter: Option<UnmatchedCounter>) -> Self {
        Self {
            counters: RunCounters::default(),
            per_sample_metrics: vec![SampleMetrics::default(); num_samples],
            unmatched_counter,
        }
    }

    /// Write the metrics files associated with the [`DemuxMetrics`].
    ///
    /// This will create a `metrics.tsv` file, a `per_sample_metrics.tsv` file, and, when
    /// unmatched barcodes were tracked and `most_unmatched_to_output` is non-zero, a
    /// `most_frequent_unmatched.tsv` file in the provided `output_dir`.
    pub fn write_metrics_files<P: AsRef<Path>>(
        self,
        samples: &[SampleMetadata],
        output_dir: P,
        prefix: &str,
        most_unmatched_to_output: usize,
    ) -> Result<()> {
        let delim = DelimFile::default();

        let filename = [prefix.to_string(), "metrics.tsv".to_string()].concat();
        let output_path = output_dir.as_ref().join(filename);
        delim
            .write_tsv(&output_path, std::iter::once(self.counters))
            .with_context(|| format!("Failed to write {:?}", output_path))?;

        let filename = [prefix.to_string(), "per_sample_metrics.tsv".to_string()].concat();
        let output_path = output_dir.as_ref().join(filename);
        delim
            .write_tsv(&output_path, self.processed_sample_metrics(samples))
            .with_context(|| format!("Failed to write {:?}", output_path))?;

        if most_unmatched_to_output > 0 {
            if let Some(unmatched_counter) = self.unmatched_counter {
                unmatched_counter.to_file(&output_dir, most_unmatched_to_output, prefix)?;
            }
        }
        Ok(())
    }

    /// Build the per sample metrics to output, deriving the ratios.
    fn processed_sample_metrics(&self, samples: &[SampleMetadata]) -> Vec<SampleMetricsProcessed> {
        let total_templates = self.per_sample_metrics.iter().map(|m| m.total_matches).sum();
        // Don't include undetermined when determining the "best" barcode.
        let best_barcode_count = self
            .per_sample_metrics
            .iter()
            .take(self.per_sample_metrics.len().saturating_sub(1))
            .map(|s| s.total_matches)
            .max()
            .unwrap_or(0);
        samples
            .iter()
            .zip(self.per_sample_metrics.iter())
            .map(|(sample, metrics)| {
                metrics.as_processed(total_templates, best_barcode_count, sample)
            })
            .collect()
    }
}

/// A helper struct for serializing and deserializing barcode counts.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct BarcodeCount {
    /// The barcode pair, `INDEX1+INDEX2`.
    pub(crate) barcode: String,
    /// the count of the barcode.
    pub(crate) count: isize,
}

impl BarcodeCount {
    /// Create a new [`BarcodeCount`] instance.
    fn new(barcode: BString, count: isize) -> Self {
        Self { barcode: barcode.to_string(), count }
    }
}

/// The per-sample metrics as written to file.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SampleMetricsProcessed {
    /// The sample identifier from the sample sheet.
    pub(crate) sample_id: String,
    /// The sample barcode pair, `INDEX1+INDEX2`, or `+` for the undetermined sample.
    pub(crate) barcode: String,
    /// The total number of templates matching the given barcode.
    pub(crate) templates: usize,
    /// The number of templates that match perfectly the given barcode.
    pub(crate) perfect_matches: usize,
    /// The number of templates that match the given barcode with one or more mismatches.
    pub(crate) mismatched_matches: usize,
    /// The fraction of all templates (matched or undetermined) that match the given barcode.
    pub(crate) fraction_matches: f64,
    /// The rate of all templates matching this barcode to all template reads matching the most
    /// prevalent barcode.  May exceed one for the undetermined sample.
    pub(crate) ratio_this_barcode_to_best_barcode: f64,
}
