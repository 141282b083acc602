//! Collapsing of per-frame label sequences.
//!
use itertools::Itertools;

/// Merge runs of identical adjacent labels and join the result with single spaces.
///
/// Only adjacent repeats are merged: `A A B B A` becomes `A B A`, and a single stray label
/// between two runs of the same sign leaves three runs.
pub fn collapse<I>(labels: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    labels
        .into_iter()
        .dedup_by(|a, b| a.as_ref() == b.as_ref())
        .map(|label| label.as_ref().to_owned())
        .join(" ")
}
