//! Functionality directly related to demultiplexing the four synchronized input streams.
//!
//! For every aligned [`RecordTuple`] the [`Demultiplexer`]:
//! 1. counts the pair,
//! 2. checks the index qualities against the [`QualityThresholds`], dropping the pair on the
//!    first failing check,
//! 3. looks the observed index1/index2 pair up with its [`Matcher`], and
//! 4. hands read1 and read2 to an [`OutputRouter`], either for the matched sample or, with the
//!    observed indexes appended to the read names, for the undetermined sample.
//!
//! Processing stops, without error, as soon as any of the streams is exhausted.  Input FASTQs of
//! unequal length are therefore not detected; the final counts show how many pairs were read.

use anyhow::{ensure, Result};
use seq_io::fastq::OwnedRecord;

use crate::{
    matcher::{MatchResult, Matcher},
    metrics::{DemuxMetrics, ProgressReporter, RunCounters},
};

/// The offset of Phred scores in FASTQ quality strings.
pub const PHRED_OFFSET: u8 = 33;

/// Progress is reported each time the read count reaches a multiple of this.
pub const PROGRESS_INTERVAL: usize = 1_000;

/// The four records read at the same position of the index1, index2, read1, and read2 streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTuple {
    pub index1: OwnedRecord,
    pub index2: OwnedRecord,
    pub read1: OwnedRecord,
    pub read2: OwnedRecord,
}

impl RecordTuple {
    /// Build a tuple from exactly four records, in index1, index2, read1, read2 order.
    pub fn from_records(records: Vec<OwnedRecord>) -> Result<Self> {
        let found = records.len();
        match <[OwnedRecord; 4]>::try_from(records) {
            Ok([index1, index2, read1, read2]) => Ok(Self { index1, index2, read1, read2 }),
            Err(_) => anyhow::bail!("Expected four records per tuple, found {}", found),
        }
    }
}

/// Summary statistics of the Phred scores of one read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityStats {
    pub mean: f64,
    pub min: u8,
}

impl QualityStats {
    /// Compute the statistics for a FASTQ quality string.  An empty string has a mean and a
    /// minimum of zero.
    pub fn from_quals(quals: &[u8]) -> Self {
        if quals.is_empty() {
            return Self { mean: 0.0, min: 0 };
        }
        let mut sum: u64 = 0;
        let mut min = u8::MAX;
        for q in quals.iter().map(|q| q.saturating_sub(PHRED_OFFSET)) {
            sum += u64::from(q);
            min = min.min(q);
        }
        Self { mean: sum as f64 / quals.len() as f64, min }
    }
}

/// The reason a read pair was dropped by the quality checks, in the order the checks are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityFailure {
    Index1BadMean,
    Index2BadMean,
    Index1BadMin,
    Index2BadMin,
}

impl QualityFailure {
    /// Charge the pair to the counter for this failure.
    fn charge(self, counters: &mut RunCounters) {
        match self {
            Self::Index1BadMean => counters.index1_bad_mean += 2,
            Self::Index2BadMean => counters.index2_bad_mean += 2,
            Self::Index1BadMin => counters.index1_bad_min += 2,
            Self::Index2BadMin => counters.index2_bad_min += 2,
        }
    }
}

/// The minimum index qualities a read pair needs to be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// The minimum quality of every index base.
    pub scores_min: u8,
    /// The minimum mean quality of each index read.
    pub scores_mean: u8,
}

impl QualityThresholds {
    /// Check the index qualities, returning the first failed check if any.  Mean checks come
    /// before minimum checks, and index1 before index2.
    pub fn check(&self, index1_quals: &[u8], index2_quals: &[u8]) -> Option<QualityFailure> {
        let index1 = QualityStats::from_quals(index1_quals);
        let index2 = QualityStats::from_quals(index2_quals);
        let scores_mean = f64::from(self.scores_mean);
        if index1.mean < scores_mean {
            Some(QualityFailure::Index1BadMean)
        } else if index2.mean < scores_mean {
            Some(QualityFailure::Index2BadMean)
        } else if index1.min < self.scores_min {
            Some(QualityFailure::Index1BadMin)
        } else if index2.min < self.scores_min {
            Some(QualityFailure::Index2BadMin)
        } else {
            None
        }
    }
}

/// What happened to one read pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Dropped(QualityFailure),
    Matched { sample_index: usize, hamming_dist: usize },
    Undetermined,
}

/// Receives the read pairs assigned to each sample.
///
/// `sample_index` is the position of the sample in the sample sheet, with the undetermined
/// sample last.  Pairs must be written in the order received.
pub trait OutputRouter {
    fn write_pair(
        &mut self,
        sample_index: usize,
        read1: &OwnedRecord,
        read2: &OwnedRecord,
    ) -> Result<()>;
}

/// Appends a space and the observed index to a read name.
fn annotate_name(head: &mut Vec<u8>, index: &[u8]) {
    head.reserve(index.len() + 1);
    head.push(b' ');
    head.extend_from_slice(index);
}

/// Demultiplexes read pairs given a [`Matcher`] over the samples' barcode pairs.
pub struct Demultiplexer<'a, M: Matcher> {
    matcher: &'a M,
    thresholds: QualityThresholds,
    /// The sample index of the undetermined sample.
    undetermined_index: usize,
}

impl<'a, M> Demultiplexer<'a, M>
where
    M: Matcher,
{
    /// Create a new [`Demultiplexer`].
    ///
    /// # Arguments
    /// - `matcher` - resolves observed barcode pairs to sample indexes
    /// - `thresholds` - the index quality thresholds
    /// - `undetermined_index` - the sample index unmatched pairs are routed to
    pub fn new(matcher: &'a M, thresholds: QualityThresholds, undetermined_index: usize) -> Self {
        Self { matcher, thresholds, undetermined_index }
    }

    /// Make and carry out the decision for one read pair, updating the metrics.
    pub fn demultiplex_tuple<R: OutputRouter>(
        &self,
        tuple: RecordTuple,
        router: &mut R,
        metrics: &mut DemuxMetrics,
    ) -> Result<Decision> {
        metrics.counters.count += 2;

        if let Some(failure) = self.thresholds.check(&tuple.index1.qual, &tuple.index2.qual) {
            failure.charge(&mut metrics.counters);
            return Ok(Decision::Dropped(failure));
        }

        let match_result = self.matcher.find(&tuple.index1.seq, &tuple.index2.seq);
        match match_result {
            MatchResult::Match { sample_index, hamming_dist, .. } => {
                metrics.counters.matched += 2;
                if let Some(sample_metrics) = metrics.per_sample_metrics.get_mut(sample_index) {
                    sample_metrics.update_with_match(&match_result);
                }
                router.write_pair(sample_index, &tuple.read1, &tuple.read2)?;
                Ok(Decision::Matched { sample_index, hamming_dist })
            }
            MatchResult::NoMatch { ref barcode } => {
                metrics.counters.undetermined += 2;
                if let Some(sample_metrics) =
                    metrics.per_sample_metrics.get_mut(self.undetermined_index)
                {
                    sample_metrics.update_with_match(&match_result);
                }
                if let Some(unmatched_counter) = metrics.unmatched_counter.as_mut() {
                    unmatched_counter.insert(barcode);
                }

                let RecordTuple { index1, index2, mut read1, mut read2 } = tuple;
                annotate_name(&mut read1.head, &index1.seq);
                annotate_name(&mut read2.head, &index2.seq);
                router.write_pair(self.undetermined_index, &read1, &read2)?;
                Ok(Decision::Undetermined)
            }
        }
    }

    /// Demultiplex every aligned tuple of the four sources, in index1, index2, read1, read2
    /// order.  Stops when the first source is exhausted; any error reading a record or writing
    /// a pair ends the run and is returned.  A read error is returned even when another source
    /// runs out at the same position.
    ///
    /// When a [`ProgressReporter`] is given, a snapshot of the counters is offered to it every
    /// [`PROGRESS_INTERVAL`] reads.
    pub fn run<I, R>(
        &self,
        mut sources: Vec<I>,
        router: &mut R,
        metrics: &mut DemuxMetrics,
        progress: Option<&ProgressReporter>,
    ) -> Result<()>
    where
        I: Iterator<Item = Result<OwnedRecord>>,
        R: OutputRouter,
    {
        ensure!(sources.len() == 4, "Expected four input sources, found {}", sources.len());
        loop {
            // Every source is pulled before checking for the end so no read error is skipped.
            let mut records = Vec::with_capacity(sources.len());
            let mut exhausted = false;
            for source in &mut sources {
                match source.next() {
                    Some(record) => records.push(record?),
                    None => exhausted = true,
                }
            }
            if exhausted {
                break;
            }
            self.demultiplex_tuple(RecordTuple::from_records(records)?, router, metrics)?;
            if let Some(progress) = progress {
                if metrics.counters.count % PROGRESS_INTERVAL == 0 {
                    progress.report(&metrics.counters);
                }
            }
        }
        Ok(())
    }
}
