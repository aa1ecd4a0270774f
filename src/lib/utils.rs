//! Utility functions.
use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use strum::IntoEnumIterator;

use crate::{fastq_source::FastqKind, sample_metadata::SampleMetadata};

lazy_static! {
    /// Return the number of cpus as a String
    pub static ref NUM_CPU: String = num_cpus::get().to_string();
}

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string: the package version, followed by the short git commit
    /// hash and a `-dirty` marker when that information was available at build time.
    fn get_software_version() -> String {
        let mut version = PKG_VERSION.to_string();
        if let Some(hash) = GIT_COMMIT_HASH {
            version.push('-');
            version.push_str(&hash[0..hash.len().min(8)]);
        }
        if let Some(true) = GIT_DIRTY {
            version.push_str("-dirty");
        }
        version
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

/// Determine the output file name for the given sample and read number (1 or 2).
pub fn filename(sample: &SampleMetadata, read_number: u32) -> String {
    format!("{}_S{}_L00{}_R{}_001.fastq.gz", sample.sample_id, sample.ordinal + 1, 1, read_number)
}

/// Determine the read1 and read2 output paths for a sample.
pub fn filenames<P: AsRef<Path>>(sample: &SampleMetadata, output_dir: P) -> [PathBuf; 2] {
    [output_dir.as_ref().join(filename(sample, 1)), output_dir.as_ref().join(filename(sample, 2))]
}

lazy_static! {
    /// <*>_L00#_<R# or I#>_001.fastq[.gz]
    static ref INPUT_FASTQ_REGEX: Regex =
        Regex::new(r"^(.*)_L00(\d{1})_([RI])(\d{1})_001\.fastq(\.gz)?$").unwrap();
}

/// Contains information about a FASTQ that has been inferred from the file name: the prefix
/// shared by the FASTQs of one run, the lane, and which of the four inputs it is.
#[derive(Debug, Clone)]
pub struct InputFastq {
    pub path: PathBuf,
    pub prefix: String,
    pub lane: usize,
    pub kind: FastqKind,
}

impl InputFastq {
    /// Create a new `InputFastq` inferring information from the file name.  Returns `None`
    /// unless the name matches `<prefix>_L00<lane>_<I1|I2|R1|R2>_001.fastq[.gz]`.
    pub fn new<P: AsRef<Path>>(path: P) -> Option<InputFastq> {
        let file_name = path.as_ref().file_name()?.to_string_lossy();
        let captures = INPUT_FASTQ_REGEX.captures(&file_name)?;
        let prefix = captures.get(1)?.as_str().to_string();
        let lane = captures.get(2)?.as_str().parse::<usize>().ok()?;
        let segment = captures.get(3)?.as_str().chars().next()?;
        let number = captures.get(4)?.as_str().parse::<u32>().ok()?;
        let kind = FastqKind::from_fastq_id(segment, number)?;
        Some(InputFastq { path: path.as_ref().to_path_buf(), prefix, lane, kind })
    }

    /// Identifies all FASTQs that share the common path prefix and match the
    /// `INPUT_FASTQ_REGEX` pattern.  The path prefix may also be a directory.  The FASTQS are
    /// returned in sorted order.
    pub fn slurp<P: AsRef<Path>>(path_prefix: P) -> Result<Vec<InputFastq>> {
        let path_prefix = path_prefix.as_ref();
        let (parent, prefix) = if path_prefix.is_dir() {
            (path_prefix.to_path_buf(), String::new())
        } else {
            let parent = match path_prefix.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let prefix = path_prefix
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default();
            (parent, prefix)
        };

        let mut fastqs = vec![];
        for entry in std::fs::read_dir(&parent)
            .with_context(|| format!("Failed to list FASTQs in {}", parent.to_string_lossy()))?
        {
            let path = entry
                .with_context(|| format!("Failed to list FASTQs in {}", parent.to_string_lossy()))?
                .path();
            let matches_prefix =
                path.file_name().map_or(false, |f| f.to_string_lossy().starts_with(&prefix));
            if path.is_file() && matches_prefix {
                if let Some(fastq) = InputFastq::new(&path) {
                    fastqs.push(fastq);
                }
            }
        }
        fastqs.sort();
        Ok(fastqs)
    }
}

impl Ord for InputFastq {
    /// Orders by the FASTQ prefix, then the lane, then the kind (I1, I2, R1, R2).
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.lane.cmp(&other.lane))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for InputFastq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for InputFastq {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for InputFastq {}

/// Resolve the `--fastqs` argument into the index1, index2, read1, and read2 FASTQs, in that
/// order.
///
/// Either four FASTQs are given explicitly, or a single path prefix (or directory) from which
/// exactly one FASTQ of each kind is found by file name.
pub fn resolve_input_fastqs(fastqs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    match fastqs.len() {
        4 => Ok(fastqs.to_vec()),
        1 => {
            let found = InputFastq::slurp(&fastqs[0])?;
            let listing = found.iter().map(|f| f.path.to_string_lossy()).join(", ");
            ensure!(
                found.iter().map(|f| (&f.prefix, f.lane)).all_equal(),
                "FASTQs from more than one run or lane found for {}: {}",
                fastqs[0].to_string_lossy(),
                listing
            );
            let mut resolved = Vec::with_capacity(4);
            for kind in FastqKind::iter() {
                let mut of_kind = found.iter().filter(|f| f.kind == kind);
                match (of_kind.next(), of_kind.next()) {
                    (Some(fastq), None) => resolved.push(fastq.path.clone()),
                    (None, _) => bail!(
                        "No {} FASTQ found for {}, found: [{}]",
                        kind,
                        fastqs[0].to_string_lossy(),
                        listing
                    ),
                    (Some(_), Some(_)) => bail!(
                        "More than one {} FASTQ found for {}: [{}]",
                        kind,
                        fastqs[0].to_string_lossy(),
                        listing
                    ),
                }
            }
            Ok(resolved)
        }
        n => bail!(
            "Expected either four FASTQs (index1, index2, read1, read2) or a single path prefix, \
             found {}",
            n
        ),
    }
}
