//! Reading the sample sheet that defines the samples (and their dual-index barcodes) to
//! demultiplex into.

use std::fmt::Display;
use std::path::Path;

use fgoxide::io::Io;
use serde::Deserialize;
use thiserror::Error;

use crate::sample_metadata::{validate_samples, SampleMetadata};

/// The optional line number from the sample sheet where an error occurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The reason that a barcode has been deemed invalid.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBases,
}

impl Display for ReasonBarcodeInvalid {
    /// Proper error wording for each reason a barcode is invalid.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyString => write!(f, "Barcode is an empty string"),
            Self::InvalidBases => write!(f, "Barcode contains bases other than A, C, G, and T"),
        }
    }
}

/// The error that may occur when parsing the [`SampleSheet`].
#[derive(Error, Debug)]
pub enum SampleSheetError {
    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The sample sheet was empty")]
    Empty,

    #[error("Sample metadata must include at least one sample")]
    ZeroSamples,

    #[error("Unable to deserialize line number {line}")]
    DeserializeRecord { source: csv::Error, line: usize },

    #[error("Empty Sample_ID found. {line}")]
    EmptySampleId { line: ErrorLine },

    #[error("Duplicate Sample_ID found: {id}. {line}")]
    DuplicateSampleId { id: String, line: ErrorLine },

    #[error("Invalid barcode sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode { barcode: String, id: String, reason: ReasonBarcodeInvalid, line: ErrorLine },

    #[error("{sample_a} and {sample_b} have the same barcode pair: {index1}+{index2}")]
    DuplicateBarcodePair { sample_a: String, sample_b: String, index1: String, index2: String },
}

/// A single row of the sample sheet, as found in the file.
#[derive(Debug, Deserialize)]
struct SampleRecord {
    #[serde(alias = "Sample_ID", alias = "Sample_Id", alias = "id")]
    sample_id: String,
    #[serde(alias = "Index1_Sequence", alias = "Index1")]
    index1: String,
    #[serde(alias = "Index2_Sequence", alias = "Index2")]
    index2: String,
}

/// The validated samples read from a sample sheet.
///
/// The last sample is always the undetermined sample.
#[derive(Debug, Clone)]
pub struct SampleSheet {
    pub samples: Vec<SampleMetadata>,
}

impl SampleSheet {
    /// Builds a `SampleSheet` from the CSV at the given path.
    ///
    /// The CSV must have a header line with `Sample_ID`, `Index1_Sequence`, and
    /// `Index2_Sequence` columns (`sample_id`/`id`, `index1`, and `index2` are also accepted).
    /// Each subsequent row corresponds to a single sample, and the order of the rows is the
    /// order of the samples in all outputs.
    ///
    /// # Arguments
    /// - `path` - the path to the sample sheet
    /// - `reverse_complement_index2` - true to reverse complement the index2 barcodes
    /// - `undetermined_name` - the name to give the sample that collects unmatched reads
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        reverse_complement_index2: bool,
        undetermined_name: &str,
    ) -> Result<Self, SampleSheetError> {
        let io = Io::default();
        let lines = io.read_lines(&path).map_err(SampleSheetError::FgError)?;

        if lines.iter().all(|l| l.trim().is_empty()) {
            return Err(SampleSheetError::Empty);
        }

        let data = lines.join("\n");
        Self::from_reader(data.as_bytes(), reverse_complement_index2, undetermined_name)
    }

    /// Reads the samples from a CSV reader.  See [`SampleSheet::from_path`].
    pub fn from_reader<R: std::io::Read>(
        reader: R,
        reverse_complement_index2: bool,
        undetermined_name: &str,
    ) -> Result<Self, SampleSheetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(b',')
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut samples = vec![];
        for (ordinal, record) in reader.deserialize().enumerate() {
            // Line numbers are +2 to account for the header and 1-based counting
            let record: SampleRecord = record.map_err(|e| SampleSheetError::DeserializeRecord {
                source: e,
                line: ordinal + 2,
            })?;
            let mut sample = SampleMetadata::new(
                record.sample_id,
                record.index1.into(),
                record.index2.into(),
                ordinal,
            );
            sample.line_number = Some(ordinal + 2);
            if reverse_complement_index2 {
                sample = sample.with_reverse_complemented_index2();
            }
            samples.push(sample);
        }

        let samples = validate_samples(samples, undetermined_name)?;
        Ok(SampleSheet { samples })
    }
}
