#![forbid(unsafe_code)]

use std::{path::PathBuf, vec::Vec};

use clap::Parser;
use env_logger::Env;

use crate::{
    demux::QualityThresholds,
    matcher::UNDETERMINED_NAME,
    utils::{built_info, NUM_CPU},
};

pub static TOOL_NAME: &str = "pairdemux";

static SHORT_USAGE: &str =
    "Demultiplexes dual-indexed paired-end FASTQs into per-sample FASTQs, tolerating index mismatches.";

static LONG_USAGE: &str = "
Demultiplexes dual-indexed paired-end FASTQs into per-sample FASTQs, tolerating index mismatches.

Four FASTQs are read in lock-step: the index1 (I1), index2 (I2), read1 (R1), and read2 (R2)
reads of each cluster.  They may be given explicitly, in that order, or as a single path prefix
(or directory) from which FASTQs named <prefix>_L00<lane>_<I1|I2|R1|R2>_001.fastq.gz are found.
Inputs may be uncompressed, GZIP, or BGZF compressed.  Reading stops at the end of the shortest
input.

Pairs whose index1 or index2 qualities fall below --min-index-mean-quality (mean) or
--min-index-base-quality (any base) are dropped.  Every other pair is written to the sample
whose index1 and index2 are each within --max-mismatches of the observed indexes, or else to
the undetermined sample with the observed indexes appended to the read names.  Two samples
within reach of the same observed index pair are an error.

The sample metadata file must be a CSV file with a header and the columns Sample_ID,
Index1_Sequence, and Index2_Sequence.

The output directory specified with --output-dir must exist.  Per-sample files named like
<Sample_ID>_S1_L001_R1_001.fastq.gz and run metrics (metrics.tsv, per_sample_metrics.tsv, and
most_frequent_unmatched.tsv) will be written to the output directory.

Example invocation:

pairdemux \\
  --fastqs I1.fq.gz I2.fq.gz R1.fq.gz R2.fq.gz \\
  --sample-metadata samples.csv \\
  --output-dir demuxed-fastqs/
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// Path to the input FASTQs: index1, index2, read1, and read2, or a single path prefix.
    #[clap(long, short = 'f', display_order = 1, required = true, multiple_values = true)]
    pub fastqs: Vec<PathBuf>,

    /// Path to the sample metadata.
    #[clap(long, short = 's', display_order = 2)]
    pub sample_metadata: PathBuf,

    /// The directory to write outputs, the directory must exist.
    ///
    /// This tool will overwrite existing files.
    #[clap(long, short, display_order = 3)]
    pub output_dir: PathBuf,

    /// Number of allowed mismatches between each observed index and the expected index.
    #[clap(long, short = 'm', default_value = "1", display_order = 11)]
    pub max_mismatches: usize,

    /// Drop pairs with any index1 or index2 base quality below this value.
    #[clap(long, short = 'q', default_value = "10", display_order = 11)]
    pub min_index_base_quality: u8,

    /// Drop pairs with a mean index1 or index2 base quality below this value.
    #[clap(long, short = 'Q', default_value = "20", display_order = 11)]
    pub min_index_mean_quality: u8,

    /// Reverse complement the index2 sequences of the sample metadata.
    #[clap(long, short = 'R', display_order = 11)]
    pub reverse_complement_index2: bool,

    /// The sample name for undetermined reads (reads that do not match an expected barcode).
    #[clap(long, short = 'u', default_value = UNDETERMINED_NAME, display_order = 21)]
    pub undetermined_sample_name: String,

    /// Output the most frequent "unmatched" barcodes up to this number.
    ///
    /// If set to 0 unmatched barcodes will not be collected.
    #[clap(long, short = 'U', default_value = "1000", display_order = 21)]
    pub most_unmatched_to_output: usize,

    /// Max number of keys the most unmatched hash map is allowed to contain.
    #[clap(long, default_value = "5000000", display_order = 21, hide = true)]
    pub most_unmatched_max_map_size: usize,

    /// Number of keys to shrink the most unmatched hash map down to when it hits the `most_unmatched_max_map_size`.
    #[clap(long, default_value = "5000", display_order = 21, hide = true)]
    pub most_unmatched_downsize_to: usize,

    /// The prefix to prepend to the names of the metrics files.
    #[clap(long, default_value = "", display_order = 21)]
    pub metrics_prefix: String,

    /// Log progress every 1000 reads.
    #[clap(long, short = 'v', display_order = 21)]
    pub verbose: bool,

    /// Number of threads for compression the output reads.
    ///
    /// The number of threads to use for compressing reads that are queued for writing.
    #[clap(long, default_value = NUM_CPU.as_str(), display_order = 31)]
    pub compressor_threads: usize,

    /// Number of threads for writing compressed reads to output.
    ///
    /// The number of threads to have writing reads to their individual output files.
    #[clap(long, default_value = "5", display_order = 31)]
    pub writer_threads: usize,

    /// The number of threads to use for decompression for each BGZF reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,
}

impl Opts {
    /// The index quality thresholds from the CLI opts.
    pub fn quality_thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            scores_min: self.min_index_base_quality,
            scores_mean: self.min_index_mean_quality,
        }
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            fastqs: vec![],
            sample_metadata: PathBuf::default(),
            output_dir: PathBuf::default(),
            max_mismatches: 1,
            min_index_base_quality: 10,
            min_index_mean_quality: 20,
            reverse_complement_index2: false,
            undetermined_sample_name: UNDETERMINED_NAME.to_string(),
            most_unmatched_to_output: 1_000,
            most_unmatched_max_map_size: 5_000_000,
            most_unmatched_downsize_to: 5_000,
            metrics_prefix: String::new(),
            verbose: false,
            compressor_threads: 4,
            writer_threads: 4,
            decompression_threads_per_reader: 4,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Opts;
    use crate::demux::QualityThresholds;

    #[test]
    fn test_parse_defaults_match_test_defaults() {
        let opts = Opts::try_parse_from([
            "pairdemux",
            "--fastqs",
            "i1.fq",
            "i2.fq",
            "r1.fq",
            "r2.fq",
            "--sample-metadata",
            "samples.csv",
            "--output-dir",
            "out",
        ])
        .unwrap();
        let defaults = Opts::default();

        assert_eq!(opts.fastqs.len(), 4);
        assert_eq!(opts.sample_metadata, PathBuf::from("samples.csv"));
        assert_eq!(opts.max_mismatches, defaults.max_mismatches);
        assert_eq!(opts.min_index_base_quality, defaults.min_index_base_quality);
        assert_eq!(opts.min_index_mean_quality, defaults.min_index_mean_quality);
        assert_eq!(opts.undetermined_sample_name, defaults.undetermined_sample_name);
        assert_eq!(opts.most_unmatched_to_output, defaults.most_unmatched_to_output);
        assert_eq!(opts.most_unmatched_max_map_size, defaults.most_unmatched_max_map_size);
        assert_eq!(opts.most_unmatched_downsize_to, defaults.most_unmatched_downsize_to);
        assert_eq!(opts.metrics_prefix, defaults.metrics_prefix);
        assert!(!opts.reverse_complement_index2);
        assert!(!opts.verbose);
        assert_eq!(opts.writer_threads, 5);
        assert_eq!(opts.compressor_threads, num_cpus::get());
    }

    #[test]
    fn test_parse_short_options() {
        let opts = Opts::try_parse_from([
            "pairdemux", "-f", "run", "-s", "s.csv", "-o", "out", "-m", "0", "-q", "5", "-Q", "30",
            "-R", "-v", "-u", "Unknown", "-U", "0",
        ])
        .unwrap();
        assert_eq!(opts.fastqs, vec![PathBuf::from("run")]);
        assert_eq!(opts.max_mismatches, 0);
        assert_eq!(opts.quality_thresholds(), QualityThresholds { scores_min: 5, scores_mean: 30 });
        assert!(opts.reverse_complement_index2);
        assert!(opts.verbose);
        assert_eq!(opts.undetermined_sample_name, "Unknown");
        assert_eq!(opts.most_unmatched_to_output, 0);
    }

    #[test]
    fn test_parse_requires_fastqs() {
        assert!(Opts::try_parse_from(["pairdemux", "-s", "s.csv", "-o", "out"]).is_err());
    }
}
