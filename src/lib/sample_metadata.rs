#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]

use std::collections::{HashMap, HashSet};

use bstr::{BStr, BString, ByteSlice};

use crate::sample_sheet::{ErrorLine, ReasonBarcodeInvalid, SampleSheetError};

/// The bases that are allowed in the [`SampleMetadata::index1`] and [`SampleMetadata::index2`].
pub const ALLOWED_BASES: &[u8] = &[b'A', b'C', b'T', b'G'];

/// Metadata about a sample.
///
/// The ordinal position of the sample in the sample sheet is its identity for the barcode lookup
/// and for the output writers.
#[derive(Debug, Clone, PartialEq, Hash, Eq)]
pub struct SampleMetadata {
    /// The unique identifier for the sample.
    pub sample_id: String,

    /// The upper-cased sample barcode expected in the index1 read.
    pub index1: BString,

    /// The upper-cased sample barcode expected in the index2 read.
    pub index2: BString,

    /// The number of the sample in the samplesheet (corresponds to the row number), starts at 0.
    pub ordinal: usize,

    /// The line number in the input in which this sample was defined
    pub line_number: Option<usize>,
}

impl SampleMetadata {
    /// Create a new [`SampleMetadata`] object.  The barcodes are upper-cased but otherwise left
    /// as-is; see [`validate_samples`] for validation.
    pub fn new(sample_id: String, index1: BString, index2: BString, ordinal: usize) -> Self {
        Self {
            sample_id,
            index1: index1.to_ascii_uppercase().into(),
            index2: index2.to_ascii_uppercase().into(),
            ordinal,
            line_number: None,
        }
    }

    /// Returns a copy of this sample with the index2 barcode reverse complemented.
    pub fn with_reverse_complemented_index2(self) -> Self {
        let index2 = reverse_complement(&self.index2).into();
        Self { index2, ..self }
    }

    /// The barcode pair in `index1+index2` form, used for reporting.
    pub fn barcode_pair(&self) -> String {
        format!("{}+{}", self.index1, self.index2)
    }

    /// Run a set of validations on a barcode to ensure that it is well formed.
    ///
    /// # Errors
    ///
    /// - [`SampleSheetError::InvalidBarcode`] if the barcode is empty or has non-ACGT bases
    pub fn validate_barcode(
        barcode: &BStr,
        id: &str,
        line_number: Option<usize>,
    ) -> Result<(), SampleSheetError> {
        let reason = if barcode.is_empty() {
            Some(ReasonBarcodeInvalid::EmptyString)
        } else if !barcode.iter().all(|b| ALLOWED_BASES.contains(b)) {
            Some(ReasonBarcodeInvalid::InvalidBases)
        } else {
            None
        };
        match reason {
            Some(reason) => Err(SampleSheetError::InvalidBarcode {
                id: id.to_owned(),
                barcode: barcode.to_string(),
                reason,
                line: ErrorLine(line_number),
            }),
            None => Ok(()),
        }
    }
}

/// Reverse complement a DNA sequence.  Bases other than `ACGT` become `N`.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'T' => b'A',
            b'G' => b'C',
            b'C' => b'G',
            _ => b'N',
        })
        .collect()
}

/// Validates a set of samples ([`SampleMetadata`] objects) and appends the undetermined sample.
///
/// Checks that there is at least one sample, that sample identifiers are non-empty and unique,
/// that every barcode is non-empty and made of `ACGT`, and that no two samples share the same
/// index1/index2 barcode pair.
///
/// The undetermined sample is given the next ordinal and empty barcodes.
///
/// # Errors
///
/// - [`SampleSheetError::ZeroSamples`]
/// - [`SampleSheetError::EmptySampleId`]
/// - [`SampleSheetError::DuplicateSampleId`]
/// - [`SampleSheetError::InvalidBarcode`]
/// - [`SampleSheetError::DuplicateBarcodePair`]
pub fn validate_samples(
    mut samples: Vec<SampleMetadata>,
    undetermined_name: &str,
) -> Result<Vec<SampleMetadata>, SampleSheetError> {
    if samples.is_empty() {
        return Err(SampleSheetError::ZeroSamples);
    }

    let mut ids = HashSet::new();
    let mut barcodes: HashMap<(&BStr, &BStr), &str> = HashMap::new();
    for sample in &samples {
        if sample.sample_id.trim().is_empty() {
            return Err(SampleSheetError::EmptySampleId { line: ErrorLine(sample.line_number) });
        }
        if !ids.insert(sample.sample_id.as_str()) {
            return Err(SampleSheetError::DuplicateSampleId {
                id: sample.sample_id.clone(),
                line: ErrorLine(sample.line_number),
            });
        }
        SampleMetadata::validate_barcode(
            sample.index1.as_bstr(),
            &sample.sample_id,
            sample.line_number,
        )?;
        SampleMetadata::validate_barcode(
            sample.index2.as_bstr(),
            &sample.sample_id,
            sample.line_number,
        )?;

        let key = (sample.index1.as_bstr(), sample.index2.as_bstr());
        if let Some(other) = barcodes.insert(key, &sample.sample_id) {
            return Err(SampleSheetError::DuplicateBarcodePair {
                sample_a: other.to_string(),
                sample_b: sample.sample_id.clone(),
                index1: sample.index1.to_string(),
                index2: sample.index2.to_string(),
            });
        }
    }

    // Ordinals follow the order of the samples
    for (ordinal, sample) in samples.iter_mut().enumerate() {
        sample.ordinal = ordinal;
    }

    let undetermined_ordinal = samples.len();
    samples.push(SampleMetadata::new(
        String::from(undetermined_name),
        BString::from(""),
        BString::from(""),
        undetermined_ordinal,
    ));

    Ok(samples)
}
