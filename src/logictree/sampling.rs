use rand::Rng;

use super::BranchSet;

/// Weighted pick of one branch index. Levels are validated beforehand, so
/// weights are positive and sum to 1 within tolerance; the last branch
/// absorbs any rounding slack.
fn pick<R: Rng>(set: &BranchSet, rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut acc = 0.0;
    for (i, br) in set.branches.iter().enumerate() {
        acc += br.weight;
        if u < acc {
            return i;
        }
    }
    set.branches.len() - 1
}

/// One path through `levels`, one branch index per level.
pub fn sample_one<R: Rng>(levels: &[&BranchSet], rng: &mut R) -> Vec<usize> {
    levels.iter().map(|set| pick(set, rng)).collect()
}

/// `n` independent paths drawn from one stream.
pub fn sample_paths<R: Rng>(levels: &[&BranchSet], n: usize, rng: &mut R) -> Vec<Vec<usize>> {
    (0..n).map(|_| sample_one(levels, rng)).collect()
}
