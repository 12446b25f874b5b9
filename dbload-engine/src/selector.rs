//! Two-level weighted selection of operation kinds.
//!
//! The first level picks a category (for example `read` or `write`), the second level picks an
//! operation within that category. Both levels are configured as percentages and must each sum
//! to 100.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;

use crate::error::ConfigError;
use crate::operation::OperationKind;

/// Allowed deviation of a weight set from 100.
pub const WEIGHT_TOLERANCE: f64 = 0.01;

/// Weights of a single category.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryWeights {
    /// Share of this category among all categories, in percent.
    pub weight: f64,
    /// Share of each operation within this category, in percent.
    pub operations: BTreeMap<OperationKind, f64>,
}

impl CategoryWeights {
    /// Creates category weights from a list of operation weights.
    pub fn new(weight: f64, operations: impl IntoIterator<Item = (OperationKind, f64)>) -> Self {
        Self {
            weight,
            operations: operations.into_iter().collect(),
        }
    }
}

/// The classic read/write mix: 90% reads (80/15/5 point/secondary/range), 10% writes (50/50).
pub fn default_categories() -> BTreeMap<String, CategoryWeights> {
    BTreeMap::from([
        (
            "read".to_owned(),
            CategoryWeights::new(
                90.0,
                [
                    (OperationKind::PointReadPrimary, 80.0),
                    (OperationKind::PointReadSecondary, 15.0),
                    (OperationKind::RangeRead, 5.0),
                ],
            ),
        ),
        (
            "write".to_owned(),
            CategoryWeights::new(
                10.0,
                [(OperationKind::Insert, 50.0), (OperationKind::Update, 50.0)],
            ),
        ),
    ])
}

/// Items drawn with probability proportional to their weight.
#[derive(Clone, Debug)]
struct Weighted<T> {
    items: Vec<T>,
    index: WeightedIndex<f64>,
}

impl<T: Copy> Weighted<T> {
    /// Validates that the weights are non-negative and sum to 100.
    fn build(scope: &str, entries: impl IntoIterator<Item = (T, f64)>) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Weights {
            scope: scope.to_owned(),
            reason,
        };

        let (items, weights): (Vec<T>, Vec<f64>) = entries.into_iter().unzip();
        if let Some(weight) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(invalid(format!(
                "weight {weight} must be a finite, non-negative number"
            )));
        }
        if items.is_empty() {
            return Err(invalid("no entries configured".into()));
        }
        let total = weights.iter().sum::<f64>();
        if (total - 100.0).abs() > WEIGHT_TOLERANCE {
            return Err(invalid(format!("weights must sum to 100, got {total}")));
        }

        let index = WeightedIndex::new(&weights).map_err(|err| invalid(err.to_string()))?;
        Ok(Self { items, index })
    }

    fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> T {
        self.items[self.index.sample(rng)]
    }
}

/// Chooses an operation kind per request according to configured weights.
///
/// Construction validates all weights; selection is infallible and deterministic for a given
/// random source.
#[derive(Clone, Debug)]
pub struct OperationSelector {
    categories: Weighted<usize>,
    operations: Vec<Weighted<OperationKind>>,
}

impl OperationSelector {
    /// Builds a selector from per-category weights.
    ///
    /// Fails if the category weights or any category's operation weights do not sum to 100
    /// (within [`WEIGHT_TOLERANCE`]), or if an operation is listed in more than one category.
    pub fn new(categories: &BTreeMap<String, CategoryWeights>) -> Result<Self, ConfigError> {
        let mut operations = Vec::with_capacity(categories.len());
        let mut seen = HashSet::new();

        for (name, category) in categories {
            for kind in category.operations.keys() {
                if !seen.insert(*kind) {
                    return Err(ConfigError::Weights {
                        scope: format!("category {name:?}"),
                        reason: format!("operation `{kind}` is listed in more than one category"),
                    });
                }
            }

            operations.push(Weighted::build(
                &format!("category {name:?}"),
                category.operations.iter().map(|(kind, weight)| (*kind, *weight)),
            )?);
        }

        let categories = Weighted::build(
            "categories",
            categories
                .values()
                .enumerate()
                .map(|(index, category)| (index, category.weight)),
        )?;

        Ok(Self {
            categories,
            operations,
        })
    }

    /// Draws the next operation kind: first its category, then the operation within it.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> OperationKind {
        self.operations[self.categories.pick(rng)].pick(rng)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    #[test]
    fn default_mix_is_valid() {
        let selector = OperationSelector::new(&default_categories()).unwrap();
        assert_eq!(selector.operations.len(), 2);
    }

    #[test]
    fn rejects_category_sum_mismatch() {
        let mut categories = default_categories();
        categories.get_mut("write").unwrap().weight = 20.0;

        let err = OperationSelector::new(&categories).unwrap_err();
        assert!(matches!(err, ConfigError::Weights { ref scope, .. } if scope == "categories"));
    }

    #[test]
    fn rejects_operation_sum_mismatch() {
        let mut categories = default_categories();
        categories
            .get_mut("read")
            .unwrap()
            .operations
            .insert(OperationKind::RangeRead, 6.0);

        let err = OperationSelector::new(&categories).unwrap_err();
        assert!(
            matches!(err, ConfigError::Weights { ref scope, .. } if scope == "category \"read\"")
        );
    }

    #[test]
    fn accepts_sums_within_tolerance() {
        let categories = BTreeMap::from([(
            "all".to_owned(),
            CategoryWeights::new(
                100.0,
                [
                    (OperationKind::PointReadPrimary, 33.333),
                    (OperationKind::Insert, 33.333),
                    (OperationKind::Update, 33.333),
                ],
            ),
        )]);
        assert!(OperationSelector::new(&categories).is_ok());
    }

    #[test]
    fn rejects_duplicate_operations() {
        let categories = BTreeMap::from([
            (
                "a".to_owned(),
                CategoryWeights::new(50.0, [(OperationKind::Insert, 100.0)]),
            ),
            (
                "b".to_owned(),
                CategoryWeights::new(50.0, [(OperationKind::Insert, 100.0)]),
            ),
        ]);
        assert!(OperationSelector::new(&categories).is_err());
    }

    #[test]
    fn rejects_negative_and_empty_weights() {
        let negative = BTreeMap::from([(
            "a".to_owned(),
            CategoryWeights::new(
                100.0,
                [(OperationKind::Insert, 150.0), (OperationKind::Update, -50.0)],
            ),
        )]);
        assert!(OperationSelector::new(&negative).is_err());

        let empty = BTreeMap::from([("a".to_owned(), CategoryWeights::new(100.0, []))]);
        assert!(OperationSelector::new(&empty).is_err());

        assert!(OperationSelector::new(&BTreeMap::new()).is_err());
    }

    #[test]
    fn zero_weights_are_never_selected() {
        let categories = BTreeMap::from([
            (
                "read".to_owned(),
                CategoryWeights::new(
                    100.0,
                    [
                        (OperationKind::PointReadPrimary, 0.0),
                        (OperationKind::RangeRead, 100.0),
                    ],
                ),
            ),
            (
                "write".to_owned(),
                CategoryWeights::new(0.0, [(OperationKind::Insert, 100.0)]),
            ),
        ]);
        let selector = OperationSelector::new(&categories).unwrap();

        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..10_000 {
            assert_eq!(selector.select(&mut rng), OperationKind::RangeRead);
        }
    }

    #[test]
    fn frequencies_follow_weights() {
        let selector = OperationSelector::new(&default_categories()).unwrap();
        let mut rng = SmallRng::seed_from_u64(11);

        let samples = 100_000;
        let mut counts = HashMap::new();
        for _ in 0..samples {
            *counts.entry(selector.select(&mut rng)).or_insert(0usize) += 1;
        }

        let expected = [
            (OperationKind::PointReadPrimary, 0.72),
            (OperationKind::PointReadSecondary, 0.135),
            (OperationKind::RangeRead, 0.045),
            (OperationKind::Insert, 0.05),
            (OperationKind::Update, 0.05),
        ];
        for (kind, share) in expected {
            let observed = counts.get(&kind).copied().unwrap_or_default() as f64 / samples as f64;
            assert!(
                (observed - share).abs() < 0.01,
                "{kind}: observed {observed}, expected {share}"
            );
        }
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let selector = OperationSelector::new(&default_categories()).unwrap();
        let draw = |seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            (0..1000).map(|_| selector.select(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));
    }
}
