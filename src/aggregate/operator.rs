use super::types::Composable;
use crate::error::Result;

/// Composition of independent probabilities: `1 - (1 - a)(1 - b)`.
#[inline]
pub fn compose_probabilities(a: f64, b: f64) -> f64 {
    1.0 - (1.0 - a) * (1.0 - b)
}

/// Binary operator folding values together, element-wise.
///
/// Whatever the variant, the operator must be associative and commutative
/// with 0 as identity: partial results arrive in completion order.
#[derive(Debug, Clone, Copy, Default)]
pub enum AggregationOperator {
    #[default]
    ProbabilityComposition,
    Sum,
    Custom(fn(f64, f64) -> f64),
}

impl AggregationOperator {
    #[inline]
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            AggregationOperator::ProbabilityComposition => compose_probabilities(a, b),
            AggregationOperator::Sum => a + b,
            AggregationOperator::Custom(f) => f(a, b),
        }
    }

    /// `acc <- acc ⊕ value`.
    pub fn combine<V: Composable>(&self, acc: &mut V, value: &V) -> Result<()> {
        acc.compose_with(value, &|a, b| self.apply(a, b))
    }
}
