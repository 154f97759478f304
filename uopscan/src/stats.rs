
use std::collections::BTreeMap;

/// A list of observed counter deltas for a single measurement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawResults(pub Vec<u32>);

/// Implemented on types which contain a list of observed values.
///
/// The reductions return `None` for an empty list.
pub trait ResultList<D: Copy + Ord> {
    /// Return a reference to the list of values.
    fn data(&self) -> &[D];

    /// Return the number of observed values.
    fn len(&self) -> usize { self.data().len() }

    fn is_empty(&self) -> bool { self.data().is_empty() }

    /// Return the minimum value in the list.
    fn get_min(&self) -> Option<D> { self.data().iter().min().copied() }

    /// Return the maximum value in the list.
    fn get_max(&self) -> Option<D> { self.data().iter().max().copied() }

    /// Return the most-frequent value in the list.
    /// When several values are equally frequent, the smallest one wins.
    fn get_mode(&self) -> Option<D> {
        // The histogram iterates in ascending order, and we only replace the
        // current pick on a strictly larger count.
        self.histogram().into_iter()
            .fold(None, |best: Option<(D, usize)>, (val, cnt)| match best {
                Some((_, best_cnt)) if best_cnt >= cnt => best,
                _ => Some((val, cnt)),
            })
            .map(|(val, _)| val)
    }

    /// Return a histogram counting the distribution of all values in the list.
    fn histogram(&self) -> BTreeMap<D, usize> {
        let mut dist = BTreeMap::new();
        for r in self.data().iter() {
            *dist.entry(*r).or_insert(0) += 1;
        }
        dist
    }

    /// Returns the number of times that a particular value occurs in the list.
    fn count(&self, val: D) -> usize {
        self.data().iter().filter(|x| **x == val).count()
    }
}

impl ResultList<u32> for RawResults {
    fn data(&self) -> &[u32] { &self.0 }
}
