use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};

use crate::{
    demux::Demultiplexer,
    fastq_source::FastqSource,
    matcher::BarcodeLookup,
    metrics::{DemuxMetrics, ProgressReporter, UnmatchedCounter},
    opts::Opts,
    pooled_sample_writer::PooledSampleRouter,
    sample_sheet::SampleSheet,
    utils::resolve_input_fastqs,
};

/// Run demultiplexing.
///
/// The writers and their pool are always shut down, even when demultiplexing fails part way;
/// the first error encountered is returned.
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    let fastqs = resolve_input_fastqs(&opts.fastqs)?;

    // Preflight checks
    ensure!(
        opts.output_dir.is_dir(),
        "Output directory does not exist: {}",
        &opts.output_dir.to_string_lossy()
    );

    info!("Reading sample metadata from {}", opts.sample_metadata.to_string_lossy());
    let samples = SampleSheet::from_path(
        &opts.sample_metadata,
        opts.reverse_complement_index2,
        &opts.undetermined_sample_name,
    )
    .with_context(|| {
        format!("Failed to read sample metadata: {}", opts.sample_metadata.to_string_lossy())
    })?
    .samples;
    let undetermined_index = samples.len() - 1;

    info!(
        "Building the barcode lookup for {} samples allowing {} mismatches",
        undetermined_index, opts.max_mismatches
    );
    let lookup = BarcodeLookup::build(&samples[..undetermined_index], opts.max_mismatches)?;
    debug!("The barcode lookup holds {} barcode pairs", lookup.len());

    info!("Opening input FASTQs");
    let sources = fastqs
        .iter()
        .map(|fastq| FastqSource::from_path(fastq, opts.decompression_threads_per_reader))
        .collect::<Result<Vec<_>>>()?;

    let unmatched_counter = if opts.most_unmatched_to_output > 0 {
        Some(UnmatchedCounter::new(
            opts.most_unmatched_max_map_size,
            opts.most_unmatched_downsize_to,
        ))
    } else {
        None
    };
    let mut metrics = DemuxMetrics::new(samples.len(), unmatched_counter);
    let progress = if opts.verbose { Some(ProgressReporter::new(None)?) } else { None };

    info!("Creating writers");
    let (mut pool, mut router) = PooledSampleRouter::create(
        &samples,
        &opts.output_dir,
        opts.writer_threads,
        opts.compressor_threads,
    )?;

    info!("Demultiplexing");
    let demuxer = Demultiplexer::new(&lookup, opts.quality_thresholds(), undetermined_index);
    let demuxed = demuxer.run(sources, &mut router, &mut metrics, progress.as_ref());

    if let Some(progress) = progress {
        debug!("Logged {} progress snapshots", progress.finish());
    }
    info!("Closing writers");
    let finished = router.finish();
    info!("Stopping pool");
    let stopped = pool.stop_pool().context("Failed to stop the writer pool");
    demuxed.and(finished).and(stopped)?;

    info!(
        "Processed {} read pairs, {} reads matched a sample and {} were undetermined",
        metrics.counters.count / 2,
        metrics.counters.matched,
        metrics.counters.undetermined
    );
    if metrics.counters.dropped() > 0 {
        info!("Dropped {} reads with low index qualities", metrics.counters.dropped());
    }
    if !metrics.counters.is_conserved() {
        warn!("Run counters do not add up: {}", metrics.counters);
    }

    info!("Writing metrics");
    metrics.write_metrics_files(
        &samples,
        &opts.output_dir,
        &opts.metrics_prefix,
        opts.most_unmatched_to_output,
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        fs::create_dir,
        path::{Path, PathBuf},
    };

    use fgoxide::io::DelimFile;
    use matches::assert_matches;
    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;

    use super::run;
    use crate::{
        matcher::IndexBuildError,
        metrics::{BarcodeCount, RunCounters, SampleMetricsProcessed},
        opts::Opts,
        utils::test_commons::{create_sample_sheet_file, slurp_fastq, write_input_fastqs, Fq},
    };

    const SAMPLES: &[(&str, &str, &str)] =
        &[("s1", "AAAAAAAA", "CCCCCCCC"), ("s2", "GGGGGGGG", "TTTTTTTT")];

    /// Build the index1, index2, read1, and read2 records of one cluster.
    fn cluster(
        name: &str,
        index1: &[u8],
        index2: &[u8],
        index1_quals: Option<&[u8]>,
    ) -> [OwnedRecord; 4] {
        [
            Fq { name, bases: index1, quals: index1_quals }.to_owned_record(),
            Fq { name, bases: index2, quals: None }.to_owned_record(),
            Fq { name, bases: b"GATTACA", quals: None }.to_owned_record(),
            Fq { name, bases: b"TGTAATC", quals: None }.to_owned_record(),
        ]
    }

    fn clusters() -> Vec<[OwnedRecord; 4]> {
        vec![
            cluster("p1", b"AAAAAAAA", b"CCCCCCCC", None),
            cluster("p2", b"AAAAAAAT", b"CCCCCCCC", None),
            cluster("p3", b"GGGGGGGG", b"TTTTTTTT", None),
            cluster("p4", b"ACGTACGT", b"TTTTACGT", None),
            cluster("p5", b"AAAAAAAA", b"CCCCCCCC", Some(b"########")),
            cluster("p6", b"acgtacgt", b"ttttacgt", None),
        ]
    }

    fn opts_for(dir: &Path, fastqs: Vec<PathBuf>) -> Opts {
        let output_dir = dir.join("output");
        create_dir(&output_dir).unwrap();
        Opts {
            fastqs,
            sample_metadata: create_sample_sheet_file(dir, SAMPLES),
            output_dir,
            compressor_threads: 2,
            writer_threads: 2,
            decompression_threads_per_reader: 2,
            ..Opts::default()
        }
    }

    fn names(records: &[OwnedRecord]) -> Vec<String> {
        records.iter().map(|r| String::from_utf8(r.head.clone()).unwrap()).collect()
    }

    #[test]
    fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let fastqs = write_input_fastqs(dir.path(), "run", &clusters());
        let opts = opts_for(dir.path(), fastqs);
        let output_dir = opts.output_dir.clone();
        run(opts).unwrap();

        let s1_r1 = slurp_fastq(output_dir.join("s1_S1_L001_R1_001.fastq.gz"));
        let s1_r2 = slurp_fastq(output_dir.join("s1_S1_L001_R2_001.fastq.gz"));
        assert_eq!(names(&s1_r1), vec!["p1", "p2"]);
        assert_eq!(names(&s1_r2), vec!["p1", "p2"]);
        assert_eq!(s1_r1[0].seq, b"GATTACA".to_vec());
        assert_eq!(s1_r2[0].seq, b"TGTAATC".to_vec());

        let s2_r1 = slurp_fastq(output_dir.join("s2_S2_L001_R1_001.fastq.gz"));
        assert_eq!(names(&s2_r1), vec!["p3"]);

        let undetermined_r1 =
            slurp_fastq(output_dir.join("Undetermined_S3_L001_R1_001.fastq.gz"));
        let undetermined_r2 =
            slurp_fastq(output_dir.join("Undetermined_S3_L001_R2_001.fastq.gz"));
        assert_eq!(names(&undetermined_r1), vec!["p4 ACGTACGT", "p6 acgtacgt"]);
        assert_eq!(names(&undetermined_r2), vec!["p4 TTTTACGT", "p6 ttttacgt"]);

        let delim = DelimFile::default();
        let counters: Vec<RunCounters> = delim.read_tsv(&output_dir.join("metrics.tsv")).unwrap();
        assert_eq!(
            counters,
            vec![RunCounters {
                count: 12,
                matched: 6,
                undetermined: 4,
                index1_bad_mean: 2,
                ..RunCounters::default()
            }]
        );

        let per_sample: Vec<SampleMetricsProcessed> =
            delim.read_tsv(&output_dir.join("per_sample_metrics.tsv")).unwrap();
        assert_eq!(
            per_sample.iter().map(|s| s.sample_id.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2", "Undetermined"]
        );
        assert_eq!(per_sample[0].templates, 2);
        assert_eq!(per_sample[0].perfect_matches, 1);
        assert_eq!(per_sample[0].mismatched_matches, 1);
        assert_eq!(per_sample[1].templates, 1);
        assert_eq!(per_sample[2].templates, 2);

        let unmatched: Vec<BarcodeCount> =
            delim.read_tsv(&output_dir.join("most_frequent_unmatched.tsv")).unwrap();
        assert_eq!(
            unmatched,
            vec![BarcodeCount { barcode: "ACGTACGT+TTTTACGT".to_string(), count: 2 }]
        );
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_fastqs_found_from_prefix_or_directory(#[case] use_directory: bool) {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        create_dir(&inputs).unwrap();
        write_input_fastqs(&inputs, "run", &clusters());
        let fastq_arg = if use_directory { inputs.clone() } else { inputs.join("run") };
        let opts = Opts {
            metrics_prefix: String::from("run."),
            most_unmatched_to_output: 0,
            ..opts_for(dir.path(), vec![fastq_arg])
        };
        let output_dir = opts.output_dir.clone();
        run(opts).unwrap();

        let s1_r1 = slurp_fastq(output_dir.join("s1_S1_L001_R1_001.fastq.gz"));
        assert_eq!(names(&s1_r1), vec!["p1", "p2"]);
        assert!(output_dir.join("run.metrics.tsv").exists());
        assert!(output_dir.join("run.per_sample_metrics.tsv").exists());
        assert!(!output_dir.join("run.most_frequent_unmatched.tsv").exists());
    }

    #[test]
    fn test_stops_at_the_shortest_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut fastqs = write_input_fastqs(dir.path(), "run", &clusters());
        // Replace read2 with a FASTQ holding only the first two clusters.
        let short = write_input_fastqs(dir.path(), "short", &clusters()[..2]);
        fastqs[3] = short[3].clone();
        let opts = opts_for(dir.path(), fastqs);
        let output_dir = opts.output_dir.clone();
        run(opts).unwrap();

        let counters: Vec<RunCounters> =
            DelimFile::default().read_tsv(&output_dir.join("metrics.tsv")).unwrap();
        assert_eq!(counters[0].count, 4);
        assert_eq!(counters[0].matched, 4);
        assert!(slurp_fastq(output_dir.join("Undetermined_S3_L001_R1_001.fastq.gz")).is_empty());
    }

    #[test]
    fn test_ambiguous_samples_fail_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let fastqs = write_input_fastqs(dir.path(), "run", &clusters());
        let sample_metadata = create_sample_sheet_file(
            dir.path(),
            &[("s1", "AAAAAAAA", "CCCCCCCC"), ("s2", "AAAAAAAT", "CCCCCCCA")],
        );
        let opts = Opts { sample_metadata, ..opts_for(dir.path(), fastqs) };
        let output_dir = opts.output_dir.clone();

        let err = run(opts).unwrap_err();
        assert_matches!(
            err.downcast_ref::<IndexBuildError>(),
            Some(IndexBuildError::Ambiguity { .. })
        );
        assert!(!output_dir.join("s1_S1_L001_R1_001.fastq.gz").exists());
    }

    #[test]
    fn test_missing_output_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fastqs = write_input_fastqs(dir.path(), "run", &clusters());
        let opts = Opts { output_dir: dir.path().join("missing"), ..opts_for(dir.path(), fastqs) };
        let message = format!("{:#}", run(opts).unwrap_err());
        assert!(message.contains("Output directory does not exist"), "{}", message);
    }

    #[test]
    fn test_unreadable_input_fails_after_closing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut fastqs = write_input_fastqs(dir.path(), "run", &clusters());
        let bad = dir.path().join("bad.fastq");
        std::fs::write(&bad, "@p1\nGATTACA\n+\nIIIIIII\np2\nGATTACA\n+\nIIIIIII\n").unwrap();
        fastqs[2] = bad;
        let opts = opts_for(dir.path(), fastqs);
        let output_dir = opts.output_dir.clone();

        let message = format!("{:#}", run(opts).unwrap_err());
        assert!(message.contains("bad.fastq"), "{}", message);
        // The first pair was written and flushed before the failure.
        let s1_r1 = slurp_fastq(output_dir.join("s1_S1_L001_R1_001.fastq.gz"));
        assert_eq!(names(&s1_r1), vec!["p1"]);
        assert!(!output_dir.join("metrics.tsv").exists());
    }

    #[test]
    fn test_reverse_complement_index2() {
        let dir = tempfile::tempdir().unwrap();
        // GGGGGGGG reverse complemented is CCCCCCCC, so p1 and p2 match s1.
        let sample_metadata =
            create_sample_sheet_file(dir.path(), &[("s1", "AAAAAAAA", "GGGGGGGG")]);
        let fastqs = write_input_fastqs(dir.path(), "run", &clusters()[..2]);
        let opts = Opts {
            sample_metadata,
            reverse_complement_index2: true,
            ..opts_for(dir.path(), fastqs)
        };
        let output_dir = opts.output_dir.clone();
        run(opts).unwrap();
        let s1_r1 = slurp_fastq(output_dir.join("s1_S1_L001_R1_001.fastq.gz"));
        assert_eq!(names(&s1_r1), vec!["p1", "p2"]);
    }
}
