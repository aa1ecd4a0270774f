//! Create a lookup table that contains all observable index1/index2 barcode pairs that are
//! within the maximum number of mismatches of a sample's expected barcode pair.
//!
//! Each barcode is expanded independently into its Hamming ball (all sequences within
//! `max_mismatches` substitutions), and every combination of an index1 ball member with an
//! index2 ball member is inserted into the table.  An observed pair reachable from two samples
//! is ambiguous and fails the whole build.
//!
//! The table is keyed by the barcode bytes themselves (`INDEX1+INDEX2`), not by a hash of
//! them, so two unrelated barcode pairs can never be confused for one another.

use std::collections::hash_map::Entry;

use ahash::{AHashMap, AHashSet};
use bstr::BString;
use itertools::Itertools;
use log::{debug, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::sample_metadata::SampleMetadata;

/// The alphabet over which barcode substitutions are generated.
const BASES: &[u8] = &[b'A', b'C', b'G', b'T'];

/// Separates index1 from index2 in a lookup key.
const BARCODE_DELIMITER: u8 = b'+';

/// Lookup tables estimated to hold more entries than this are logged as a warning.
const LARGE_LOOKUP_WARNING: usize = 50_000_000;

/// The name given to the "undetermined" sample
pub const UNDETERMINED_NAME: &str = "Undetermined";

#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub enum MatchResult {
    Match { sample_index: usize, hamming_dist: usize, barcode: Vec<u8> },
    NoMatch { barcode: Vec<u8> },
}

impl MatchResult {
    /// The observed barcode pair, upper-cased, in `INDEX1+INDEX2` form.
    pub fn barcode(&self) -> &Vec<u8> {
        match self {
            MatchResult::Match { barcode, .. } | MatchResult::NoMatch { barcode } => barcode,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

    pub fn is_no_match(&self) -> bool {
        !self.is_match()
    }
}

/// The base trait for all matching algorithms.
pub trait Matcher {
    fn find(&self, index1: &[u8], index2: &[u8]) -> MatchResult;
}

/// The error raised when the lookup table cannot be built.
#[derive(Error, Debug)]
pub enum IndexBuildError {
    #[error(
        "Observed barcode pair {observed} is within {max_mismatches} mismatch(es) of both \
         {sample_a} ({barcode_a}) and {sample_b} ({barcode_b})"
    )]
    Ambiguity {
        observed: String,
        max_mismatches: usize,
        sample_a: String,
        barcode_a: String,
        sample_b: String,
        barcode_b: String,
    },
}

/// Helper struct to track the hamming distance from the expected sample barcode pair to the
/// permuted observed barcode pair.
#[derive(Debug, Hash, PartialEq, Eq, Copy, Clone)]
pub struct PrecomputedMatch {
    /// The index of the sample the permuted barcode pair belongs to
    pub sample: usize,
    /// The hamming distance from the permuted to expected barcode pair, summed across both indexes
    pub hamming_dist: usize,
}

/// A matcher backed by a precomputed table of every observable barcode pair.
///
/// Built once before demultiplexing and read-only afterwards, so it may be shared freely.
#[derive(Debug)]
pub struct BarcodeLookup {
    samples_lookup: AHashMap<Vec<u8>, PrecomputedMatch>,
}

impl Matcher for BarcodeLookup {
    fn find(&self, index1: &[u8], index2: &[u8]) -> MatchResult {
        let barcode = barcode_key(index1, index2);
        match self.samples_lookup.get(&barcode) {
            Some(found) => MatchResult::Match {
                sample_index: found.sample,
                hamming_dist: found.hamming_dist,
                barcode,
            },
            None => MatchResult::NoMatch { barcode },
        }
    }
}

impl BarcodeLookup {
    /// Build the lookup for the given samples, in the order given.  The position of a sample in
    /// `samples` is the sample index returned by [`Matcher::find`].
    ///
    /// The first sample to reach an observed barcode pair owns it; any later sample reaching the
    /// same pair fails the build with [`IndexBuildError::Ambiguity`] naming both samples.
    pub fn build(
        samples: &[SampleMetadata],
        max_mismatches: usize,
    ) -> Result<Self, IndexBuildError> {
        let estimated_size = samples
            .iter()
            .map(|s| {
                ball_size(s.index1.len(), max_mismatches)
                    .saturating_mul(ball_size(s.index2.len(), max_mismatches))
            })
            .fold(0_usize, usize::saturating_add);
        if estimated_size > LARGE_LOOKUP_WARNING {
            warn!(
                "The barcode lookup will hold up to {} entries for {} samples with {} mismatches, \
                 this may need a lot of memory",
                estimated_size,
                samples.len(),
                max_mismatches
            );
        } else {
            debug!("Building a barcode lookup with up to {} entries", estimated_size);
        }

        // Each sample's balls are independent, so generate them in parallel; insertion below is
        // sequential and in sample order.
        let balls: Vec<(Vec<(Vec<u8>, usize)>, Vec<(Vec<u8>, usize)>)> = samples
            .par_iter()
            .map(|s| {
                (
                    sorted_ball_with_distances(&s.index1, max_mismatches),
                    sorted_ball_with_distances(&s.index2, max_mismatches),
                )
            })
            .collect();

        let mut samples_lookup = AHashMap::with_capacity(initial_capacity(estimated_size));
        for (sample_index, (index1_ball, index2_ball)) in balls.into_iter().enumerate() {
            for (index1, index1_dist) in &index1_ball {
                for (index2, index2_dist) in &index2_ball {
                    match samples_lookup.entry(barcode_key(index1, index2)) {
                        Entry::Occupied(entry) => {
                            let owner: &PrecomputedMatch = entry.get();
                            return Err(IndexBuildError::Ambiguity {
                                observed: BString::from(entry.key().as_slice()).to_string(),
                                max_mismatches,
                                sample_a: samples[owner.sample].sample_id.clone(),
                                barcode_a: samples[owner.sample].barcode_pair(),
                                sample_b: samples[sample_index].sample_id.clone(),
                                barcode_b: samples[sample_index].barcode_pair(),
                            });
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(PrecomputedMatch {
                                sample: sample_index,
                                hamming_dist: index1_dist + index2_dist,
                            });
                        }
                    }
                }
            }
        }

        Ok(Self { samples_lookup })
    }

    /// The number of observable barcode pairs in the lookup.
    pub fn len(&self) -> usize {
        self.samples_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples_lookup.is_empty()
    }
}

/// Caps a saturated size estimate so that pre-allocation cannot overflow.
fn initial_capacity(estimated_size: usize) -> usize {
    estimated_size.min(LARGE_LOOKUP_WARNING)
}

/// Builds the lookup key for a barcode pair: the upper-cased index1, the delimiter, and the
/// upper-cased index2.
fn barcode_key(index1: &[u8], index2: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(index1.len() + index2.len() + 1);
    key.extend(index1.iter().map(u8::to_ascii_uppercase));
    key.push(BARCODE_DELIMITER);
    key.extend(index2.iter().map(u8::to_ascii_uppercase));
    key
}

/// Generate the Hamming ball of the given radius around a barcode: every sequence over `ACGT`
/// within `max_mismatches` substitutions of the (upper-cased) barcode, including itself.
///
/// The ball is grown one substitution at a time.  Each round only expands the sequences first
/// reached in the previous round, since substitutions of older members are already present.
pub fn hamming_ball(barcode: &[u8], max_mismatches: usize) -> AHashSet<Vec<u8>> {
    let barcode = barcode.to_ascii_uppercase();
    let capacity = initial_capacity(ball_size(barcode.len(), max_mismatches));
    let mut ball = AHashSet::with_capacity(capacity);
    ball.insert(barcode.clone());

    // Once every position may have been substituted no new sequences can be reached.
    let rounds = max_mismatches.min(barcode.len());
    let mut frontier = vec![barcode];
    for _ in 0..rounds {
        let mut next = vec![];
        for seq in &frontier {
            for position in 0..seq.len() {
                for base in BASES.iter().filter(|b| **b != seq[position]) {
                    let mut permuted = seq.clone();
                    permuted[position] = *base;
                    if !ball.contains(&permuted) {
                        ball.insert(permuted.clone());
                        next.push(permuted);
                    }
                }
            }
        }
        frontier = next;
    }
    ball
}

/// The members of the Hamming ball around `barcode`, sorted, each with its distance to `barcode`.
fn sorted_ball_with_distances(barcode: &[u8], max_mismatches: usize) -> Vec<(Vec<u8>, usize)> {
    hamming_ball(barcode, max_mismatches)
        .into_iter()
        .map(|seq| {
            let dist = hamming_distance(barcode, &seq);
            (seq, dist)
        })
        .sorted()
        .collect()
}

/// The number of distinct sequences within `max_mismatches` substitutions of a sequence of
/// length `len` over a four letter alphabet: `sum_{k=0..m} C(len, k) * 3^k`.
///
/// Saturates at `usize::MAX`.
pub fn ball_size(len: usize, max_mismatches: usize) -> usize {
    let mut total: usize = 0;
    let mut choose: usize = 1;
    let mut substitutions: usize = 1;
    for k in 0..=max_mismatches.min(len) {
        total = total.saturating_add(choose.saturating_mul(substitutions));
        choose = choose.saturating_mul(len - k) / (k + 1);
        substitutions = substitutions.saturating_mul(3);
    }
    total
}

/// Hamming distance on slice of bytes, ignoring case.
///
/// Skips length check and will stop comparing after alpha is exhausted.
fn hamming_distance(alpha: &[u8], beta: &[u8]) -> usize {
    alpha.iter().zip(beta.iter()).filter(|(a, b)| !a.eq_ignore_ascii_case(b)).count()
}

#[cfg(test)]
mod test {
    use bstr::BString;
    use itertools::Itertools;
    use matches::assert_matches;
    use rstest::rstest;

    use super::{
        ball_size, hamming_ball, hamming_distance, BarcodeLookup, IndexBuildError, MatchResult,
        Matcher, BASES, initial_capacity, LARGE_LOOKUP_WARNING,
    };
    use crate::sample_metadata::SampleMetadata;

    pub(super) fn create_sample(id: &str, index1: &str, index2: &str) -> SampleMetadata {
        SampleMetadata::new(String::from(id), BString::from(index1), BString::from(index2), 0)
    }

    /// All sequences of the given length over `ACGT`.
    fn all_sequences(len: usize) -> Vec<Vec<u8>> {
        if len == 0 {
            return vec![vec![]];
        }
        (0..len).map(|_| BASES.iter().copied()).multi_cartesian_product().collect()
    }

    #[rstest]
    #[case(1, 0, 1)]
    #[case(1, 1, 4)]
    #[case(2, 1, 7)]
    #[case(2, 2, 16)]
    #[case(4, 1, 13)]
    #[case(4, 2, 67)]
    #[case(8, 1, 25)]
    #[case(8, 2, 277)]
    #[case(8, 3, 1789)]
    fn test_ball_size(#[case] len: usize, #[case] max_mismatches: usize, #[case] expected: usize) {
        assert_eq!(ball_size(len, max_mismatches), expected);
        let barcode = "ACGT".repeat(len).as_bytes()[0..len].to_vec();
        assert_eq!(hamming_ball(&barcode, max_mismatches).len(), expected);
    }

    #[test]
    fn test_ball_size_saturates_past_barcode_length() {
        assert_eq!(ball_size(3, 3), 64);
        assert_eq!(ball_size(3, 10), 64);
        assert_eq!(hamming_ball(b"GAT", 10).len(), 64);
        assert_eq!(ball_size(64, 64), usize::MAX);
    }

    #[test]
    fn test_initial_capacity_of_saturated_estimates_is_bounded() {
        assert_eq!(initial_capacity(ball_size(40, 40)), LARGE_LOOKUP_WARNING);
        assert_eq!(initial_capacity(ball_size(8, 1)), 25);
        let estimate = ball_size(40, 20).saturating_mul(ball_size(40, 20));
        assert_eq!(initial_capacity(estimate), LARGE_LOOKUP_WARNING);
    }

    #[rstest]
    fn test_ball_is_exactly_the_sequences_within_the_radius(
        #[values(0, 1, 2, 3)] max_mismatches: usize,
        #[values("A", "GT", "ACG", "TTCA", "GATTA")] barcode: &str,
    ) {
        let ball = hamming_ball(barcode.as_bytes(), max_mismatches);
        let expected = all_sequences(barcode.len())
            .into_iter()
            .filter(|seq| hamming_distance(barcode.as_bytes(), seq) <= max_mismatches)
            .collect::<Vec<_>>();
        assert_eq!(ball.len(), expected.len());
        for seq in &expected {
            assert!(ball.contains(seq), "missing {}", String::from_utf8_lossy(seq));
        }
    }

    #[test]
    fn test_ball_is_upper_cased() {
        let ball = hamming_ball(b"acg", 0);
        assert_eq!(ball.len(), 1);
        assert!(ball.contains(&b"ACG".to_vec()));
    }

    #[test]
    fn test_exact_match_only_with_zero_mismatches() {
        let samples = vec![create_sample("s1", "AT", "CG")];
        let lookup = BarcodeLookup::build(&samples, 0).unwrap();
        assert_eq!(lookup.len(), 1);

        assert_eq!(
            lookup.find(b"AT", b"CG"),
            MatchResult::Match { sample_index: 0, hamming_dist: 0, barcode: b"AT+CG".to_vec() }
        );
        assert!(lookup.find(b"at", b"cg").is_match());
        assert!(lookup.find(b"AA", b"CG").is_no_match());
        assert!(lookup.find(b"AT", b"CC").is_no_match());
        assert!(lookup.find(b"ATC", b"G").is_no_match());
        assert_eq!(lookup.find(b"aa", b"CG").barcode(), &b"AA+CG".to_vec());
    }

    #[test]
    fn test_one_mismatch_within_budget() {
        let samples = vec![create_sample("s1", "AT", "CG")];
        let lookup = BarcodeLookup::build(&samples, 1).unwrap();
        assert_eq!(lookup.len(), 7 * 7);
        assert_eq!(
            lookup.find(b"AA", b"CG"),
            MatchResult::Match { sample_index: 0, hamming_dist: 1, barcode: b"AA+CG".to_vec() }
        );
        // one mismatch in each index is still within the per-index budget
        assert_eq!(
            lookup.find(b"AA", b"CC"),
            MatchResult::Match { sample_index: 0, hamming_dist: 2, barcode: b"AA+CC".to_vec() }
        );
        assert!(lookup.find(b"GG", b"CG").is_no_match());
    }

    #[test]
    fn test_disjoint_balls_never_collide() {
        let samples = vec![
            create_sample("s1", "AAAA", "CCCC"),
            create_sample("s2", "TTTT", "GGGG"),
            create_sample("s3", "AAAA", "GGGG"),
        ];
        let lookup = BarcodeLookup::build(&samples, 1).unwrap();
        assert_eq!(lookup.len(), 3 * 13 * 13);
        assert_matches!(lookup.find(b"AAAT", b"CCCC"), MatchResult::Match { sample_index: 0, .. });
        assert_matches!(lookup.find(b"TTTT", b"GGGA"), MatchResult::Match { sample_index: 1, .. });
        assert_matches!(lookup.find(b"AAAA", b"GGGG"), MatchResult::Match { sample_index: 2, .. });
    }

    #[test]
    fn test_intersecting_balls_are_ambiguous() {
        let samples =
            vec![create_sample("s1", "AAAA", "CCCC"), create_sample("s2", "AATT", "CCCC")];
        assert!(BarcodeLookup::build(&samples, 0).is_ok());

        let result = BarcodeLookup::build(&samples, 1);
        assert_matches!(result, Err(IndexBuildError::Ambiguity { .. }));
        if let Err(IndexBuildError::Ambiguity { sample_a, barcode_a, sample_b, barcode_b, .. }) =
            result
        {
            assert_eq!(sample_a, "s1");
            assert_eq!(barcode_a, "AAAA+CCCC");
            assert_eq!(sample_b, "s2");
            assert_eq!(barcode_b, "AATT+CCCC");
        }
    }

    #[test]
    fn test_ambiguity_message_names_samples_and_barcodes() {
        let samples = vec![create_sample("first", "AC", "GT"), create_sample("second", "AA", "GT")];
        let err = BarcodeLookup::build(&samples, 1).unwrap_err();
        let message = format!("{}", err);
        assert!(message.contains("first"), "{}", message);
        assert!(message.contains("second"), "{}", message);
        assert!(message.contains("AC+GT"), "{}", message);
        assert!(message.contains("AA+GT"), "{}", message);
    }

    #[test]
    fn test_ambiguity_is_reported_deterministically() {
        let samples = vec![
            create_sample("s1", "ACGT", "ACGT"),
            create_sample("s2", "ACGA", "ACGT"),
            create_sample("s3", "ACTT", "ACGT"),
        ];
        let first = format!("{}", BarcodeLookup::build(&samples, 2).unwrap_err());
        for _ in 0..5 {
            assert_eq!(format!("{}", BarcodeLookup::build(&samples, 2).unwrap_err()), first);
        }
        assert!(first.contains("s1") && first.contains("s2"), "{}", first);
    }

    #[test]
    fn test_hamming_dist_no_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GATTACA"), 0);
    }

    #[test]
    fn test_hamming_dist_two_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GACCACA"), 2);
    }

    #[test]
    fn test_hamming_dist_ignores_case() {
        assert_eq!(hamming_distance(b"GATTACA", b"gattaca"), 0);
    }

    #[test]
    fn test_hamming_dist_all_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"CTAATGT"), 7);
    }
}
