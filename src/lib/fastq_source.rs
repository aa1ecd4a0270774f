//! Opening the input FASTQs as synchronous sources of records.
//!
//! Each FASTQ may be uncompressed, GZIP, or BGZF compressed; the format is sniffed from the
//! first bytes of the file.  BGZF files are decompressed on a small pool of threads with `gzp`,
//! everything else goes through [`fgoxide::io::Io`].
//!
//! A [`FastqSource`] yields one record per call to `next` and never reads ahead by more than its
//! byte buffer, so four sources advanced together stay in lock-step.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use fgoxide::io::Io;
use gzp::{deflate::Bgzf, par::decompress::ParDecompressBuilder, BlockFormatSpec, BUFSIZE};
use log::debug;
use seq_io::fastq::{self, OwnedRecord};
use strum::{Display, EnumIter};

/// The four input FASTQs, in the order they are given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum FastqKind {
    #[strum(serialize = "index1")]
    Index1,
    #[strum(serialize = "index2")]
    Index2,
    #[strum(serialize = "read1")]
    Read1,
    #[strum(serialize = "read2")]
    Read2,
}

impl FastqKind {
    /// The segment character and number used for this kind in FASTQ file names, e.g. `I1`.
    pub fn fastq_id(self) -> (char, u32) {
        match self {
            Self::Index1 => ('I', 1),
            Self::Index2 => ('I', 2),
            Self::Read1 => ('R', 1),
            Self::Read2 => ('R', 2),
        }
    }

    /// The inverse of [`FastqKind::fastq_id`].
    pub fn from_fastq_id(segment: char, number: u32) -> Option<Self> {
        match (segment, number) {
            ('I', 1) => Some(Self::Index1),
            ('I', 2) => Some(Self::Index2),
            ('R', 1) => Some(Self::Read1),
            ('R', 2) => Some(Self::Read2),
            _ => None,
        }
    }
}

/// The compression format of an input FASTQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InputCompression {
    #[strum(serialize = "BGZF")]
    Bgzf,
    #[strum(serialize = "GZIP")]
    Gzip,
    #[strum(serialize = "uncompressed")]
    Plain,
}

/// Sniffs the compression format of a file from its magic bytes.
///
/// Files too short to hold a GZIP header are treated as uncompressed.
pub fn detect_compression(file: &Path) -> Result<InputCompression> {
    let mut reader = File::open(file)
        .with_context(|| format!("Failed to open {}", file.to_string_lossy()))?
        .take(Bgzf::HEADER_SIZE as u64);
    let mut bytes = Vec::with_capacity(Bgzf::HEADER_SIZE);
    reader
        .read_to_end(&mut bytes)
        .with_context(|| format!("Error reading from: {}", file.to_string_lossy()))?;

    let compression = if bytes.len() < 3 || bytes[0] != 31 || bytes[1] != 139 || bytes[2] != 8 {
        InputCompression::Plain
    } else if bytes.len() == Bgzf::HEADER_SIZE
        && bytes[3] & 4 == 4
        && bytes[12] == b'B'
        && bytes[13] == b'C'
    {
        InputCompression::Bgzf
    } else {
        InputCompression::Gzip
    };
    Ok(compression)
}

/// True if the file name ends in an extension that marks GZIP (or BGZF) content.
fn has_gzip_extension(file: &Path) -> bool {
    file.extension().map_or(false, |ext| ext == "gz" || ext == "bgz")
}

/// An iterator over the records of one FASTQ file.
pub struct FastqSource {
    /// The path the records are read from, used in error messages.
    path: PathBuf,
    reader: fastq::Reader<Box<dyn Read>>,
}

impl FastqSource {
    /// Open the FASTQ at `path`, decompressing BGZF input with
    /// `decompression_threads` threads.
    pub fn from_path<P: AsRef<Path>>(path: P, decompression_threads: usize) -> Result<Self> {
        let path = path.as_ref();
        let compression = detect_compression(path)?;
        debug!("Reading {} FASTQ {}", compression, path.to_string_lossy());

        let inner: Box<dyn Read> = match compression {
            InputCompression::Bgzf => {
                let reader = BufReader::with_capacity(
                    BUFSIZE,
                    File::open(path)
                        .with_context(|| format!("Failed to open {}", path.to_string_lossy()))?,
                );
                Box::new(
                    ParDecompressBuilder::<Bgzf>::new()
                        .num_threads(decompression_threads.max(1))
                        .with_context(|| {
                            format!(
                                "Error in setting threads when creating decompressor for {}",
                                path.to_string_lossy()
                            )
                        })?
                        .from_reader(reader),
                )
            }
            InputCompression::Gzip | InputCompression::Plain => {
                if compression == InputCompression::Gzip && !has_gzip_extension(path) {
                    bail!(
                        "Error reading from: {}\nThe file is GZIP compressed but does not end \
                         with .gz or .bgz, rename it or decompress it first.",
                        path.to_string_lossy()
                    );
                }
                if compression == InputCompression::Plain && has_gzip_extension(path) {
                    bail!(
                        "Error reading from: {}\nThe file name ends with a GZIP extension but \
                         the file is not compressed.",
                        path.to_string_lossy()
                    );
                }
                let io = Io::default();
                Box::new(
                    io.new_reader(&path)
                        .with_context(|| format!("Failed to open {}", path.to_string_lossy()))?,
                )
            }
        };

        Ok(Self::new(path, inner))
    }

    /// Wrap an already opened reader.  `path` is only used in error messages.
    pub fn new<P: AsRef<Path>>(path: P, reader: Box<dyn Read>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: fastq::Reader::with_capacity(reader, BUFSIZE),
        }
    }
}

impl Iterator for FastqSource {
    type Item = Result<OwnedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = &self.path;
        self.reader.next().map(|result| {
            result.map(|record| record.to_owned_record()).with_context(|| {
                format!("Failed to read a FASTQ record from {}", path.to_string_lossy())
            })
        })
    }
}
