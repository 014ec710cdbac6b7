//! Pending target sets.

use std::collections::BTreeSet;

use mobility_models::{ActorId, SpatialUnit};

/// Something a job computes one result for.
pub trait JobTarget {
    /// Stable id matching the id the result is committed under.
    fn target_id(&self) -> String;
}

impl JobTarget for ActorId {
    fn target_id(&self) -> String {
        self.to_string()
    }
}

impl JobTarget for SpatialUnit {
    fn target_id(&self) -> String {
        self.id()
    }
}

impl JobTarget for String {
    fn target_id(&self) -> String {
        self.clone()
    }
}

/// Targets whose id is not in a completed set, yielded lazily in input
/// order.
pub struct Pending<I> {
    targets: I,
    done: BTreeSet<String>,
    skipped: usize,
}

impl<I> Pending<I> {
    /// How many completed targets have been passed over so far.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<I> Iterator for Pending<I>
where
    I: Iterator,
    I::Item: JobTarget,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        for target in self.targets.by_ref() {
            if self.done.contains(&target.target_id()) {
                self.skipped += 1;
                continue;
            }
            return Some(target);
        }
        None
    }
}

/// The targets not yet in `done`.
///
/// Built fresh on every run from what the destination already holds, so a
/// re-run never recomputes a committed target.
pub fn pending<T, I>(targets: I, done: BTreeSet<String>) -> Pending<I::IntoIter>
where
    T: JobTarget,
    I: IntoIterator<Item = T>,
{
    Pending {
        targets: targets.into_iter(),
        done,
        skipped: 0,
    }
}

/// Number of `targets` not in `done`, for sizing progress bars.
#[must_use]
pub fn remaining<T: JobTarget>(targets: &[T], done: &BTreeSet<String>) -> u64 {
    targets
        .iter()
        .filter(|t| !done.contains(&t.target_id()))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_completed_targets() {
        let done = BTreeSet::from(["2".to_string(), "4".to_string()]);
        let mut p = pending(vec![1_i64, 2, 3, 4, 5], done);
        let left: Vec<i64> = p.by_ref().collect();
        assert_eq!(left, vec![1, 3, 5]);
        assert_eq!(p.skipped(), 2);
    }

    #[test]
    fn is_lazy() {
        let mut seen = 0;
        let targets = (0..1_000_i64).inspect(|_| seen += 1);
        let first: Vec<i64> = pending(targets, BTreeSet::new()).take(3).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(seen, 3);
    }

    #[test]
    fn everything_done_yields_nothing() {
        let done = BTreeSet::from(["a".to_string()]);
        assert_eq!(pending(vec!["a".to_string()], done).count(), 0);
    }

    #[test]
    fn counts_remaining() {
        let units = vec![
            SpatialUnit::Cell {
                cell: 0x089d_d687_6033_ffff,
            },
            SpatialUnit::Area {
                id: "r1".to_string(),
                boundary_geojson: String::new(),
            },
        ];
        let done = BTreeSet::from(["89dd6876033ffff".to_string()]);
        assert_eq!(remaining(&units, &done), 1);
    }
}
