//! A library of functionality for demultiplexing dual-indexed paired-end FASTQ files.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`sample_sheet::SampleSheet`] reads and validates the samples, appending the
//!   undetermined sample.
//! - The [`matcher::BarcodeLookup`] precomputes every index1/index2 pair within the allowed
//!   mismatches of a sample, failing if two samples can be reached by the same pair.
//! - Four [`fastq_source::FastqSource`]s (index1, index2, read1, read2) are read in lock-step.
//! - The [`demux::Demultiplexer`] drops pairs with low index qualities and routes the rest to
//!   a sample or to the undetermined sample.
//! - The [`pooled_sample_writer::PooledSampleRouter`] writes each pair to its sample's BGZF
//!   FASTQs.
//! - [`metrics`] are collected along the way and written as TSV files at the end of the run.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod demux;
pub mod fastq_source;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod pooled_sample_writer;
pub mod run;
pub mod sample_metadata;
pub mod sample_sheet;
pub mod utils;
