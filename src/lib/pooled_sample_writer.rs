//! Writing each sample's read pairs to its read1 and read2 FASTQs through a set of
//! [`PooledWriter`]s that share one compression [`Pool`].

use std::{fs::File, io::BufWriter, path::Path};

use anyhow::{ensure, Context, Result};
use gzp::BUFSIZE;
use itertools::Itertools;
use log::debug;
use pooled_writer::{bgzf::BgzfCompressor, Pool, PooledWriter};
use seq_io::{fastq::OwnedRecord, BaseRecord};

use crate::{demux::OutputRouter, sample_metadata::SampleMetadata, utils::filenames};

/// The BGZF compression level of the output FASTQs.
const COMPRESSION_LEVEL: u8 = 2;

/// A struct that holds onto the read1 and read2 [`PooledWriter`]s for a given sample.
#[derive(Debug)]
pub struct PooledSampleWriter {
    pub writers: Vec<PooledWriter>,
    pub pairs_written: usize,
}

impl PooledSampleWriter {
    /// Create a new [`PooledSampleWriter`] from the read1 and read2 writers, in that order.
    pub fn new(writers: Vec<PooledWriter>) -> Result<Self> {
        ensure!(
            writers.len() == 2,
            "Exactly two writers must be provided, found {}",
            writers.len()
        );
        Ok(Self { writers, pairs_written: 0 })
    }

    /// Write one read pair.
    pub fn write_pair(&mut self, read1: &OwnedRecord, read2: &OwnedRecord) -> Result<()> {
        read1.write(&mut self.writers[0])?;
        read2.write(&mut self.writers[1])?;
        self.pairs_written += 1;
        Ok(())
    }

    /// Consumes [`Self`]. For each held writer, call finish and drop to flush all writers.
    pub fn finish(self) -> Result<()> {
        for writer in self.writers {
            writer.close()?;
        }
        Ok(())
    }
}

/// Routes read pairs to the [`PooledSampleWriter`] of each sample, in sample order with the
/// undetermined sample last.
#[derive(Debug)]
pub struct PooledSampleRouter {
    writers: Vec<PooledSampleWriter>,
}

impl PooledSampleRouter {
    /// Group pooled writers, two per sample (read1 then read2), in sample order.
    pub fn new(pooled_writers: Vec<PooledWriter>) -> Result<Self> {
        let mut writers = vec![];
        for grouped_writers in &pooled_writers.into_iter().chunks(2) {
            writers.push(PooledSampleWriter::new(grouped_writers.collect::<Vec<_>>())?);
        }
        Ok(Self { writers })
    }

    /// Create the output FASTQs for every sample and the [`Pool`] that compresses and writes
    /// them.  Existing files are overwritten.
    pub fn create<P: AsRef<Path>>(
        samples: &[SampleMetadata],
        output_dir: P,
        writer_threads: usize,
        compressor_threads: usize,
    ) -> Result<(Pool, Self)> {
        let mut raw_writers = Vec::with_capacity(samples.len() * 2);
        for sample in samples.iter().sorted_by_key(|s| s.ordinal) {
            for name in filenames(sample, &output_dir) {
                debug!("Creating {}", name.to_string_lossy());
                let file = File::create(&name)
                    .with_context(|| format!("Unable to create file: {}", name.to_string_lossy()))?;
                raw_writers.push(BufWriter::with_capacity(BUFSIZE, file));
            }
        }
        let (pool, pooled_writers) = Pool::new::<_, BgzfCompressor>(
            writer_threads.max(1),
            compressor_threads.max(1),
            COMPRESSION_LEVEL,
            raw_writers,
        )?;
        Ok((pool, Self::new(pooled_writers)?))
    }

    /// The number of pairs written for each sample.
    pub fn pairs_written(&self) -> Vec<usize> {
        self.writers.iter().map(|w| w.pairs_written).collect()
    }

    /// Finish every writer, even if an earlier one fails; the first error is returned.
    pub fn finish(self) -> Result<()> {
        let mut result = Ok(());
        for writer in self.writers {
            let finished = writer.finish();
            if result.is_ok() {
                result = finished;
            }
        }
        result.context("Failed to flush and finish writing.")
    }
}

impl OutputRouter for PooledSampleRouter {
    fn write_pair(
        &mut self,
        sample_index: usize,
        read1: &OwnedRecord,
        read2: &OwnedRecord,
    ) -> Result<()> {
        let num_samples = self.writers.len();
        let writer = self.writers.get_mut(sample_index).with_context(|| {
            format!("No writer for sample number {} of {}", sample_index, num_samples)
        })?;
        writer
            .write_pair(read1, read2)
            .with_context(|| format!("Failed to write reads to sample number: {}", sample_index))
    }
}
