//! Generalized distance: per-feature typed differences with deviations,
//! cycles, and nulls, aggregated by a Minkowski norm, optionally
//! transformed into surprisal space.
//!
//! The Lukaszyk-Karmowski deviation correction assumes a Laplace
//! distribution by default; building with the `gaussian-distance` feature
//! switches the correction and its entropy constant.

use crate::node::{compare, NodeHandle};
use crate::string_pool::{string_pool, StringId};

/// Surprisal in nats of the assumed distribution at its own uncertainty:
/// the entropy of the distribution plus the entropy of the uncertainty.
#[cfg(not(feature = "gaussian-distance"))]
pub const SURPRISAL_OF_DISTRIBUTION: f64 = 1.5;
#[cfg(feature = "gaussian-distance")]
pub const SURPRISAL_OF_DISTRIBUTION: f64 = 1.128_379_167_095_512_6;

#[cfg(feature = "gaussian-distance")]
const TWO_OVER_SQRT_PI: f64 = 1.128_379_167_095_512_57;

/// General class of feature comparison.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FeatureType {
    /// Nominal based on numeric equivalence.
    NominalNumeric,
    /// Nominal based on string equivalence.
    NominalString,
    /// Nominal based on code equivalence.
    NominalCode,
    /// Continuous without cycles.
    #[default]
    ContinuousNumeric,
    /// Continuous with a wrap-around cycle length.
    ContinuousNumericCyclic,
    /// Edit distance between strings.
    ContinuousString,
    /// Difference between two sets of code measured in nodes.
    ContinuousCode,
}

impl FeatureType {
    pub fn is_nominal(self) -> bool {
        matches!(
            self,
            FeatureType::NominalNumeric | FeatureType::NominalString | FeatureType::NominalCode
        )
    }

    /// Parses the distance-type names used in query parameter lists.
    pub fn from_name(name: &str) -> Option<FeatureType> {
        match name {
            "nominal_numeric" => Some(FeatureType::NominalNumeric),
            "nominal_string" => Some(FeatureType::NominalString),
            "nominal_code" => Some(FeatureType::NominalCode),
            "continuous_numeric" => Some(FeatureType::ContinuousNumeric),
            "continuous_numeric_cyclic" => Some(FeatureType::ContinuousNumericCyclic),
            "continuous_string" => Some(FeatureType::ContinuousString),
            "continuous_code" => Some(FeatureType::ContinuousCode),
            _ => None,
        }
    }
}

/// One position value in feature space.
#[derive(Copy, Clone, Debug, Default)]
pub enum FeatureValue {
    #[default]
    Null,
    Number(f64),
    StringVal(StringId),
    Code(NodeHandle),
}

impl FeatureValue {
    /// Reads a feature value out of a node.
    pub fn from_node(n: NodeHandle) -> FeatureValue {
        use crate::node::NodeType;
        if n.is_null() {
            return FeatureValue::Null;
        }
        match n.node_type() {
            NodeType::Null => FeatureValue::Null,
            NodeType::Number => FeatureValue::Number(n.number_value()),
            NodeType::StringLiteral | NodeType::Symbol => FeatureValue::StringVal(n.string_id()),
            _ => FeatureValue::Code(n),
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, FeatureValue::Null)
            || matches!(self, FeatureValue::Number(v) if v.is_nan())
    }
}

/// Per-feature comparison parameters and precomputed terms.
#[derive(Clone, Debug)]
pub struct FeatureAttributes {
    pub feature_type: FeatureType,
    pub weight: f64,
    /// Measurement uncertainty of the feature's values.
    pub deviation: f64,
    pub deviation_reciprocal: f64,
    /// Number of relevant nominal classes, for nominal features.
    pub nominal_count: f64,
    /// Cycle length for cyclic features; NaN when unknown.
    pub max_cyclic_difference: f64,
    /// Difference to use when both compared values are unknown; NaN selects
    /// the default.
    pub unknown_to_unknown_difference: f64,
    /// Difference to use when exactly one value is unknown; NaN selects the
    /// default.
    pub known_to_unknown_difference: f64,
    // precomputed in initialize()
    pub(crate) nominal_match_term: f64,
    pub(crate) nominal_non_match_term: f64,
    pub(crate) unknown_to_unknown_term: f64,
    pub(crate) known_to_unknown_term: f64,
}

impl Default for FeatureAttributes {
    fn default() -> Self {
        FeatureAttributes {
            feature_type: FeatureType::ContinuousNumeric,
            weight: 1.0,
            deviation: 0.0,
            deviation_reciprocal: 0.0,
            nominal_count: 0.0,
            max_cyclic_difference: f64::NAN,
            unknown_to_unknown_difference: f64::NAN,
            known_to_unknown_difference: f64::NAN,
            nominal_match_term: 0.0,
            nominal_non_match_term: 0.0,
            unknown_to_unknown_term: 0.0,
            known_to_unknown_term: 0.0,
        }
    }
}

impl FeatureAttributes {
    fn has_deviation(&self) -> bool {
        self.deviation > 0.0
    }
}

/// The distance evaluator: feature attributes plus the Minkowski parameter
/// and transform flags. Call [`initialize`](Self::initialize) after
/// populating the attributes and before evaluating.
#[derive(Clone, Debug, Default)]
pub struct DistanceEvaluator {
    pub features: Vec<FeatureAttributes>,
    /// Minkowski parameter; 0 aggregates by product, +/- infinity by
    /// max/min.
    pub p_value: f64,
    /// Transform distances into surprisal (nats).
    pub compute_surprisal: bool,
    /// Prefer exact math over fast approximations.
    pub high_accuracy: bool,
}

impl DistanceEvaluator {
    /// Precomputes reciprocals and the match / non-match /
    /// known-to-unknown / unknown-to-unknown terms. Must be called after
    /// the feature attributes are populated.
    pub fn initialize(&mut self) {
        for i in 0..self.features.len() {
            {
                let feature = &mut self.features[i];
                feature.deviation_reciprocal = if feature.deviation > 0.0 {
                    1.0 / feature.deviation
                } else {
                    0.0
                };
            }

            let nominal = self.features[i].feature_type.is_nominal();
            self.features[i].nominal_match_term = if nominal {
                let base = self.nominal_base_exact_match(i, self.features[i].deviation);
                self.contextually_exponentiate_and_weight(base, i)
            } else {
                0.0
            };
            self.features[i].nominal_non_match_term = if nominal {
                let base = self.nominal_base_non_match(i, self.features[i].deviation);
                self.contextually_exponentiate_and_weight(base, i)
            } else {
                0.0
            };

            let k2u = self.default_null_difference(i, self.features[i].known_to_unknown_difference);
            self.features[i].known_to_unknown_term = self.term_from_difference(k2u, i);
            let u2u =
                self.default_null_difference(i, self.features[i].unknown_to_unknown_difference);
            self.features[i].unknown_to_unknown_term = self.term_from_difference(u2u, i);
        }
    }

    /// Resolves a null-comparison difference, falling back to the deviation
    /// or the feature's maximum difference when unspecified.
    fn default_null_difference(&self, index: usize, specified: f64) -> f64 {
        if !specified.is_nan() {
            return specified;
        }
        let feature = &self.features[index];
        if feature.has_deviation() {
            return feature.deviation;
        }
        self.maximum_difference(index)
    }

    /// The largest difference the feature can produce.
    pub fn maximum_difference(&self, index: usize) -> f64 {
        let feature = &self.features[index];
        if feature.feature_type.is_nominal() {
            return 1.0;
        }
        if feature.feature_type == FeatureType::ContinuousNumericCyclic {
            return feature.max_cyclic_difference / 2.0;
        }
        if feature.weight > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    }

    fn term_from_difference(&self, difference: f64, index: usize) -> f64 {
        let feature = &self.features[index];
        if feature.feature_type.is_nominal() {
            // treat as a non-match scaled to the given difference
            let base = self.nominal_base_non_match(index, difference.min(1.0).max(0.0));
            return self.contextually_exponentiate_and_weight(base, index);
        }
        let base = self.continuous_base(difference, index);
        self.contextually_exponentiate_and_weight(base, index)
    }

    // --- per-feature raw differences ---

    /// The raw distance between two feature values for the feature's kind,
    /// before deviations and weighting.
    pub fn compute_difference(&self, a: FeatureValue, b: FeatureValue, index: usize) -> f64 {
        let feature = &self.features[index];
        match feature.feature_type {
            FeatureType::NominalNumeric
            | FeatureType::NominalString
            | FeatureType::NominalCode => {
                if feature_values_equal(a, b, feature.feature_type) {
                    0.0
                } else {
                    1.0
                }
            }
            FeatureType::ContinuousNumeric | FeatureType::ContinuousNumericCyclic => {
                let (FeatureValue::Number(x), FeatureValue::Number(y)) = (a, b) else {
                    return f64::NAN;
                };
                x - y
            }
            FeatureType::ContinuousString => {
                let (FeatureValue::StringVal(x), FeatureValue::StringVal(y)) = (a, b) else {
                    return f64::NAN;
                };
                let pool = string_pool();
                edit_distance(&pool.string(x), &pool.string(y)) as f64
            }
            FeatureType::ContinuousCode => {
                let (FeatureValue::Code(x), FeatureValue::Code(y)) = (a, b) else {
                    return match (a, b) {
                        (FeatureValue::Code(x), _) => compare::deep_size(x) as f64,
                        (_, FeatureValue::Code(y)) => compare::deep_size(y) as f64,
                        _ => f64::NAN,
                    };
                };
                node_edit_distance(x, y) as f64
            }
        }
    }

    /// The fully weighted distance term for one feature, handling nulls
    /// through the precomputed terms.
    pub fn feature_distance_term(&self, a: FeatureValue, b: FeatureValue, index: usize) -> f64 {
        let feature = &self.features[index];
        match (a.is_null(), b.is_null()) {
            (true, true) => return feature.unknown_to_unknown_term,
            (true, false) | (false, true) => return feature.known_to_unknown_term,
            (false, false) => {}
        }

        if feature.feature_type.is_nominal() {
            return if feature_values_equal(a, b, feature.feature_type) {
                feature.nominal_match_term
            } else {
                feature.nominal_non_match_term
            };
        }

        let diff = self.compute_difference(a, b, index);
        if diff.is_nan() {
            return feature.known_to_unknown_term;
        }
        let base = self.continuous_base(diff, index);
        self.contextually_exponentiate_and_weight(base, index)
    }

    /// Aggregates per-feature terms into the final distance: the p-th root
    /// of the weighted sum, the product for p=0, the max/min for p=+/-inf.
    pub fn total_distance_from_terms(&self, terms: impl Iterator<Item = f64>) -> f64 {
        if self.p_value == 0.0 {
            return terms.product();
        }
        if self.p_value == f64::INFINITY {
            return terms.fold(f64::NEG_INFINITY, f64::max);
        }
        if self.p_value == f64::NEG_INFINITY {
            return terms.fold(f64::INFINITY, f64::min);
        }
        self.inverse_exponentiate_distance(terms.sum())
    }

    /// Distance between two positions in feature space.
    pub fn distance(&self, a: &[FeatureValue], b: &[FeatureValue]) -> f64 {
        let terms = (0..self.features.len().min(a.len()).min(b.len()))
            .map(|i| self.feature_distance_term(a[i], b[i], i));
        self.total_distance_from_terms(terms)
    }

    /// Exponentiation of an aggregated sum by 1/p.
    pub fn inverse_exponentiate_distance(&self, d: f64) -> f64 {
        if self.p_value == 1.0 {
            return d;
        }
        if self.p_value == 0.5 {
            return d * d;
        }
        d.powf(1.0 / self.p_value)
    }

    fn exponentiate_difference_term(&self, d: f64) -> f64 {
        if self.p_value == 1.0 {
            return d;
        }
        if self.p_value == 2.0 {
            return d * d;
        }
        d.powf(self.p_value)
    }

    /// Exponentiates and weights a base term with the extra handling the
    /// extreme p values need.
    fn contextually_exponentiate_and_weight(&self, dist_term: f64, index: usize) -> f64 {
        if dist_term == 0.0 {
            return 0.0;
        }
        let weight = self.features[index].weight;
        if self.p_value == 0.0 {
            dist_term.powf(weight)
        } else if self.p_value.is_infinite() {
            // infinite p values are treated the same as 1 for terms
            dist_term * weight
        } else {
            self.exponentiate_difference_term(dist_term) * weight
        }
    }

    /// Base continuous difference: absolute value, cyclic wrap, deviation
    /// correction.
    fn continuous_base(&self, diff: f64, index: usize) -> f64 {
        let feature = &self.features[index];
        let mut diff = diff.abs();
        if feature.feature_type == FeatureType::ContinuousNumericCyclic {
            diff = constrain_difference_to_cyclic(diff, feature.max_cyclic_difference);
        }
        if feature.has_deviation() {
            self.compute_difference_with_deviation(diff, index, self.compute_surprisal)
        } else {
            diff
        }
    }

    /// The Lukaszyk-Karmowski metric deviation component added to the
    /// difference. For the Laplace distribution the surprisal transform
    /// removes 1.5 nats: one nat of distribution information plus the half
    /// nat overcounted by the 50/50 chance the difference falls within the
    /// mean absolute error.
    #[cfg(not(feature = "gaussian-distance"))]
    pub fn compute_difference_with_deviation(
        &self,
        mut diff: f64,
        index: usize,
        surprisal_transform: bool,
    ) -> f64 {
        let deviation = self.features[index].deviation;
        diff += (-diff / deviation).exp() * (3.0 * deviation + diff) * 0.5;
        if !surprisal_transform {
            diff
        } else {
            (diff / deviation) - SURPRISAL_OF_DISTRIBUTION
        }
    }

    /// Gaussian variant of the Lukaszyk-Karmowski correction.
    #[cfg(feature = "gaussian-distance")]
    pub fn compute_difference_with_deviation(
        &self,
        mut diff: f64,
        index: usize,
        surprisal_transform: bool,
    ) -> f64 {
        let deviation = self.features[index].deviation;
        let term = diff / (2.0 * deviation);
        diff += TWO_OVER_SQRT_PI * deviation * (-term * term).exp() - diff * erfc(term);
        if !surprisal_transform {
            diff
        } else {
            (diff / deviation) - SURPRISAL_OF_DISTRIBUTION
        }
    }

    // --- nominal base terms ---

    fn nominal_base_exact_match(&self, index: usize, deviation: f64) -> f64 {
        if !self.features[index].has_deviation() || self.compute_surprisal {
            return 0.0;
        }
        deviation
    }

    fn nominal_base_non_match(&self, index: usize, deviation: f64) -> f64 {
        if self.compute_surprisal {
            // need at least two classes in existence
            let nominal_count = self.features[index].nominal_count.max(2.0);
            let prob_max_entropy_match = 1.0 / nominal_count;

            // probability the correct class was selected cannot go below
            // the base probability of guessing
            let prob_class_given_match = (1.0 - deviation).max(prob_max_entropy_match);
            let prob_class_given_non_match =
                (1.0 - prob_class_given_match) / (nominal_count - 1.0);

            let surprisal_given_match = -prob_class_given_match.ln();
            let surprisal_given_non_match = -prob_class_given_non_match.ln();
            surprisal_given_non_match - surprisal_given_match
        } else if self.features[index].has_deviation() {
            let nominal_count = self.features[index].nominal_count;
            if nominal_count > 1.0 {
                deviation + (1.0 - deviation) / (nominal_count - 1.0)
            } else {
                1.0
            }
        } else {
            1.0
        }
    }
}

/// Wraps a difference for a cyclic feature: distances beyond one cycle are
/// reduced modulo the cycle, then the closer direction around the cycle is
/// taken.
pub fn constrain_difference_to_cyclic(mut difference: f64, cycle_length: f64) -> f64 {
    if cycle_length.is_nan() {
        return difference;
    }
    if difference > cycle_length {
        difference %= cycle_length;
    }
    difference.min(cycle_length - difference)
}

fn feature_values_equal(a: FeatureValue, b: FeatureValue, feature_type: FeatureType) -> bool {
    match feature_type {
        FeatureType::NominalNumeric => match (a, b) {
            (FeatureValue::Number(x), FeatureValue::Number(y)) => x == y,
            _ => false,
        },
        FeatureType::NominalString => match (a, b) {
            (FeatureValue::StringVal(x), FeatureValue::StringVal(y)) => x == y,
            _ => false,
        },
        FeatureType::NominalCode => match (a, b) {
            (FeatureValue::Code(x), FeatureValue::Code(y)) => compare::are_deep_equal(x, y),
            _ => false,
        },
        _ => false,
    }
}

/// Levenshtein distance between two strings, by character.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            cur[j + 1] = substitution.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Number of differing nodes between two trees: equal trees are 0 apart,
/// differing immediates 1 apart, and containers pair their children
/// positionally with unpaired subtrees counted whole.
pub fn node_edit_distance(a: NodeHandle, b: NodeHandle) -> usize {
    if compare::are_shallow_equal(a, b) {
        let a_children = a.all_children();
        let b_children = b.all_children();
        let mut total = 0;
        for i in 0..a_children.len().max(b_children.len()) {
            match (a_children.get(i), b_children.get(i)) {
                (Some(&x), Some(&y)) => total += node_edit_distance(x, y),
                (Some(&x), None) => total += compare::deep_size(x),
                (None, Some(&y)) => total += compare::deep_size(y),
                (None, None) => {}
            }
        }
        total
    } else {
        1 + a
            .all_children()
            .iter()
            .map(|&c| compare::deep_size(c))
            .sum::<usize>()
            .max(
                b.all_children()
                    .iter()
                    .map(|&c| compare::deep_size(c))
                    .sum::<usize>(),
            )
    }
}

#[cfg(feature = "gaussian-distance")]
fn erfc(x: f64) -> f64 {
    // Abramowitz-Stegun 7.1.26 rational approximation, error < 1.5e-7
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x_abs = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x_abs);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = sign * (1.0 - poly * (-x_abs * x_abs).exp());
    1.0 - erf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator(features: Vec<FeatureAttributes>, p: f64) -> DistanceEvaluator {
        let mut evaluator = DistanceEvaluator {
            features,
            p_value: p,
            ..DistanceEvaluator::default()
        };
        evaluator.initialize();
        evaluator
    }

    #[test]
    fn euclidean_on_one_numeric_feature_is_absolute_difference() {
        let ev = evaluator(vec![FeatureAttributes::default()], 2.0);
        let d = ev.distance(
            &[FeatureValue::Number(3.0)],
            &[FeatureValue::Number(9.0)],
        );
        assert_eq!(d, 6.0);
    }

    #[test]
    fn minkowski_special_cases() {
        let features = vec![FeatureAttributes::default(), FeatureAttributes::default()];
        let a = [FeatureValue::Number(0.0), FeatureValue::Number(0.0)];
        let b = [FeatureValue::Number(3.0), FeatureValue::Number(4.0)];

        let ev = evaluator(features.clone(), 2.0);
        assert!((ev.distance(&a, &b) - 5.0).abs() < 1e-12);

        let ev = evaluator(features.clone(), 1.0);
        assert!((ev.distance(&a, &b) - 7.0).abs() < 1e-12);

        let ev = evaluator(features.clone(), f64::INFINITY);
        assert_eq!(ev.distance(&a, &b), 4.0);

        let ev = evaluator(features.clone(), f64::NEG_INFINITY);
        assert_eq!(ev.distance(&a, &b), 3.0);

        // p = 0 aggregates by product
        let ev = evaluator(features, 0.0);
        assert!((ev.distance(&a, &b) - 12.0).abs() < 1e-12);
    }

    #[test]
    fn cyclic_features_wrap() {
        assert_eq!(constrain_difference_to_cyclic(350.0, 360.0), 10.0);
        assert_eq!(constrain_difference_to_cyclic(10.0, 360.0), 10.0);
        assert_eq!(constrain_difference_to_cyclic(730.0, 360.0), 10.0);

        let mut feature = FeatureAttributes {
            feature_type: FeatureType::ContinuousNumericCyclic,
            max_cyclic_difference: 360.0,
            ..FeatureAttributes::default()
        };
        feature.weight = 1.0;
        let ev = evaluator(vec![feature], 1.0);
        let d = ev.distance(
            &[FeatureValue::Number(5.0)],
            &[FeatureValue::Number(355.0)],
        );
        assert_eq!(d, 10.0);
    }

    #[test]
    fn nominal_features_are_zero_or_one() {
        let feature = FeatureAttributes {
            feature_type: FeatureType::NominalNumeric,
            nominal_count: 3.0,
            ..FeatureAttributes::default()
        };
        let ev = evaluator(vec![feature], 1.0);
        let same = ev.distance(&[FeatureValue::Number(2.0)], &[FeatureValue::Number(2.0)]);
        let diff = ev.distance(&[FeatureValue::Number(2.0)], &[FeatureValue::Number(5.0)]);
        assert_eq!(same, 0.0);
        assert_eq!(diff, 1.0);
    }

    #[test]
    fn laplace_deviation_correction_shifts_small_differences() {
        #[cfg(not(feature = "gaussian-distance"))]
        {
            let feature = FeatureAttributes {
                deviation: 1.0,
                ..FeatureAttributes::default()
            };
            let mut ev = evaluator(vec![feature], 1.0);
            ev.high_accuracy = true;
            // diff 0 with deviation 1: 0 + e^0 * (3*1 + 0) * 0.5 = 1.5
            let term = ev.compute_difference_with_deviation(0.0, 0, false);
            assert!((term - 1.5).abs() < 1e-12);
            // in surprisal space the distribution's own 1.5 nats are removed
            let surprisal = ev.compute_difference_with_deviation(0.0, 0, true);
            assert!(surprisal.abs() < 1e-12);
        }
    }

    #[test]
    fn null_values_use_precomputed_terms() {
        let feature = FeatureAttributes {
            known_to_unknown_difference: 2.0,
            unknown_to_unknown_difference: 3.0,
            ..FeatureAttributes::default()
        };
        let ev = evaluator(vec![feature], 1.0);
        let k2u = ev.feature_distance_term(FeatureValue::Number(1.0), FeatureValue::Null, 0);
        let u2u = ev.feature_distance_term(FeatureValue::Null, FeatureValue::Null, 0);
        assert_eq!(k2u, 2.0);
        assert_eq!(u2u, 3.0);
    }

    #[test]
    fn string_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn nominal_surprisal_uses_class_probabilities() {
        let feature = FeatureAttributes {
            feature_type: FeatureType::NominalString,
            nominal_count: 4.0,
            deviation: 0.1,
            ..FeatureAttributes::default()
        };
        let mut ev = DistanceEvaluator {
            features: vec![feature],
            p_value: 1.0,
            compute_surprisal: true,
            high_accuracy: false,
        };
        ev.initialize();
        // -ln((1-0.9)/3) - (-ln(0.9))
        let expected = -(0.1f64 / 3.0).ln() + 0.9f64.ln();
        let a = string_pool().create_reference("alpha");
        let b = string_pool().create_reference("beta");
        let term =
            ev.feature_distance_term(FeatureValue::StringVal(a), FeatureValue::StringVal(b), 0);
        assert!((term - expected).abs() < 1e-12);
        string_pool().destroy_reference(a);
        string_pool().destroy_reference(b);
    }
}
