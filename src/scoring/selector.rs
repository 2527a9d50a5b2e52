use rand::seq::SliceRandom;

use super::types::Criterion;

/// Picks the single criterion a batch is scored under.
pub trait CriterionSelector: Send + Sync {
    /// Returns `None` only when `allowed` offers nothing to choose from.
    fn select(&self, allowed: &[Criterion]) -> Option<Criterion>;
}

/// Uniform choice over the distinct members of the allowed set.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformSelector;

impl CriterionSelector for UniformSelector {
    fn select(&self, allowed: &[Criterion]) -> Option<Criterion> {
        let distinct = distinct(allowed);
        match distinct.as_slice() {
            [] => None,
            [only] => Some(*only),
            many => many.choose(&mut rand::thread_rng()).copied(),
        }
    }
}

/// Always picks one criterion, if allowed.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub Criterion);

impl CriterionSelector for FixedSelector {
    fn select(&self, allowed: &[Criterion]) -> Option<Criterion> {
        allowed.contains(&self.0).then_some(self.0)
    }
}

fn distinct(allowed: &[Criterion]) -> Vec<Criterion> {
    let mut out: Vec<Criterion> = Vec::with_capacity(allowed.len());
    for criterion in allowed {
        if !out.contains(criterion) {
            out.push(*criterion);
        }
    }
    out
}
