//! The entity query engine: composable conditions applied in order to the
//! contained entities of a container, either narrowing the surviving set or
//! computing an aggregate over it.

use super::distance::{DistanceEvaluator, FeatureAttributes, FeatureType, FeatureValue};
use super::Entity;
use crate::node::{compare, NodeHandle, NodeManager, NodeRef, NodeType};
use crate::rand_stream::RandomStream;
use crate::string_pool::{string_pool, StringId};
use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use std::sync::Arc;

// positional parameters of the generalized-distance query opcodes
const MAX_TO_FIND_OR_MAX_DISTANCE: usize = 0;
const POSITION_LABELS: usize = 1;
const POSITION: usize = 2;
const WEIGHTS: usize = 3;
const DISTANCE_TYPES: usize = 4;
const ATTRIBUTES: usize = 5;
const DEVIATIONS: usize = 6;
const MINKOWSKI_PARAMETER: usize = 7;
const DISTANCE_VALUE_TRANSFORM: usize = 8;
const ENTITY_WEIGHT_LABEL_NAME: usize = 9;
const RANDOM_SEED: usize = 10;
const RADIUS_LABEL: usize = 11;
const NUMERICAL_PRECISION: usize = 12;
const NUM_MINKOWSKI_DISTANCE_QUERY_PARAMETERS: usize = 13;

/// One condition in a query chain, parameterized by its opcode type.
#[derive(Default)]
pub struct QueryCondition {
    pub query_type: Option<NodeType>,
    /// Labels for exists / not_exists, and the weight-0 prefilter.
    pub exist_labels: Vec<StringId>,
    /// (label, value) pairs for equals / not_equals.
    pub pairs: Vec<(StringId, NodeHandle)>,
    /// The label a single-label condition applies to.
    pub single_label: StringId,
    /// Range bounds for between / not_between and comparison value for the
    /// ordered conditions.
    pub lower: NodeHandle,
    pub upper: NodeHandle,
    /// Membership values for among / not_among.
    pub values: Vec<NodeHandle>,
    /// Ids for in_entity_list / not_in_entity_list.
    pub entity_ids: Vec<StringId>,
    /// Count for min/max/select/sample and k for nearest queries.
    pub max_to_retrieve: f64,
    /// Radius for within_generalized_distance.
    pub max_distance: f64,
    /// Offset for select.
    pub offset: usize,
    /// Quantile parameter or generalized-mean p.
    pub parameter: f64,
    /// Label supplying per-entity weights for weighted aggregations.
    pub weight_label: StringId,
    pub random_stream: Option<RandomStream>,
    /// Per-entity radius label for distance queries.
    pub radius_label: StringId,
    /// Distance query state.
    pub position_labels: Vec<StringId>,
    pub position_values: Vec<FeatureValue>,
    pub distance_evaluator: DistanceEvaluator,
    /// Compare against an explicit entity list instead of a position.
    pub compare_entity_ids: Vec<StringId>,
    pub return_sorted_list: bool,
    /// Condition applies to convictions of removing rather than keeping.
    pub conviction_of_removal: bool,
}

/// The outcome of applying a chain of conditions.
pub enum QueryResult {
    /// The surviving entities.
    Entities(Vec<Arc<Entity>>),
    /// An aggregate value; terminates the chain.
    Value(NodeRef),
}

impl QueryCondition {
    /// Builds a condition from an evaluated query node; `None` when the
    /// node is not a recognized query opcode or is malformed enough to be
    /// unusable.
    pub fn from_node(n: NodeHandle) -> Option<QueryCondition> {
        let query_type = n.node_type();
        if !query_type.is_query() {
            return None;
        }
        let ocn = n.children_copy();
        let mut condition = QueryCondition {
            query_type: Some(query_type),
            single_label: StringId::NOT_A_STRING,
            weight_label: StringId::NOT_A_STRING,
            radius_label: StringId::NOT_A_STRING,
            max_to_retrieve: 1.0,
            lower: NodeHandle::NULL,
            upper: NodeHandle::NULL,
            ..QueryCondition::default()
        };

        use NodeType::*;
        match query_type {
            QueryExists | QueryNotExists => {
                for &child in &ocn {
                    collect_label_ids(child, &mut condition.exist_labels);
                }
            }
            QueryEquals | QueryNotEquals => {
                for pair in ocn.chunks(2) {
                    let label = compare::to_string_id_if_exists(pair[0]);
                    if !label.is_string() {
                        continue;
                    }
                    let value = pair.get(1).copied().unwrap_or(NodeHandle::NULL);
                    condition.pairs.push((label, value));
                }
            }
            QueryBetween | QueryNotBetween => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                condition.lower = ocn.get(1).copied().unwrap_or(NodeHandle::NULL);
                condition.upper = ocn.get(2).copied().unwrap_or(NodeHandle::NULL);
            }
            QueryLessOrEqualTo | QueryGreaterOrEqualTo => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                condition.lower = ocn.get(1).copied().unwrap_or(NodeHandle::NULL);
            }
            QueryAmong | QueryNotAmong => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                if let Some(&values) = ocn.get(1) {
                    condition.values.extend(values.ordered_children().iter().copied());
                }
            }
            QueryInEntityList | QueryNotInEntityList => {
                for &child in &ocn {
                    collect_entity_ids(child, &mut condition.entity_ids);
                }
            }
            QueryMin | QueryMax => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                condition.max_to_retrieve = number_or(ocn.get(1), 1.0);
            }
            QuerySum | QueryMode | QueryValueMasses | QueryMinDifference | QueryMaxDifference => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                condition.weight_label =
                    compare::to_string_id_if_exists(ocn.get(1).copied().unwrap_or_default());
            }
            QueryQuantile | QueryGeneralizedMean => {
                condition.single_label =
                    compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                condition.parameter = number_or(ocn.get(1), if query_type == QueryQuantile { 0.5 } else { 1.0 });
                condition.weight_label =
                    compare::to_string_id_if_exists(ocn.get(2).copied().unwrap_or_default());
            }
            QuerySelect => {
                condition.max_to_retrieve = number_or(ocn.first(), f64::INFINITY);
                condition.offset = number_or(ocn.get(1), 0.0).max(0.0) as usize;
                condition.random_stream = seed_stream(ocn.get(2).copied());
            }
            QuerySample | QueryWeightedSample => {
                if query_type == QueryWeightedSample {
                    condition.weight_label =
                        compare::to_string_id_if_exists(ocn.first().copied().unwrap_or_default());
                    condition.max_to_retrieve = number_or(ocn.get(1), 1.0);
                    condition.random_stream = seed_stream(ocn.get(2).copied());
                } else {
                    condition.max_to_retrieve = number_or(ocn.first(), 1.0);
                    condition.random_stream = seed_stream(ocn.get(1).copied());
                }
            }
            QueryWithinGeneralizedDistance
            | QueryNearestGeneralizedDistance
            | ComputeEntityConvictions
            | ComputeEntityKlDivergences
            | ComputeEntityDistanceContributions => {
                build_distance_condition(&ocn, query_type, &mut condition);
            }
            _ => return None,
        }
        Some(condition)
    }
}

fn number_or(n: Option<&NodeHandle>, default: f64) -> f64 {
    match n {
        Some(&n) => {
            let v = compare::to_number(n, default);
            if v.is_nan() { default } else { v }
        }
        None => default,
    }
}

fn seed_stream(n: Option<NodeHandle>) -> Option<RandomStream> {
    let n = n?;
    if n.is_null_value() {
        return None;
    }
    let seed = compare::to_string(n)?;
    Some(RandomStream::from_seed_string(&seed))
}

fn collect_label_ids(n: NodeHandle, out: &mut Vec<StringId>) {
    if n.is_ordered_array() && !n.node_type().is_immediate() {
        for &child in n.ordered_children() {
            collect_label_ids(child, out);
        }
    } else {
        let id = compare::to_string_id_if_exists(n);
        if id.is_string() {
            out.push(id);
        }
    }
}

fn collect_entity_ids(n: NodeHandle, out: &mut Vec<StringId>) {
    collect_label_ids(n, out);
}

/// Parses the positional parameter layout shared by the distance queries.
fn build_distance_condition(
    ocn: &[NodeHandle],
    query_type: NodeType,
    condition: &mut QueryCondition,
) {
    if query_type == NodeType::QueryWithinGeneralizedDistance {
        condition.max_to_retrieve = f64::INFINITY;
        condition.max_distance = number_or(ocn.get(MAX_TO_FIND_OR_MAX_DISTANCE), 0.0);
    } else {
        condition.max_to_retrieve = number_or(ocn.get(MAX_TO_FIND_OR_MAX_DISTANCE), 0.0);
        condition.max_distance = f64::INFINITY;
    }

    if let Some(&labels) = ocn.get(POSITION_LABELS) {
        for &label in labels.ordered_children() {
            let id = compare::to_string_id_if_exists(label);
            if id.is_string() {
                condition.position_labels.push(id);
            }
        }
    }

    let num_features = condition.position_labels.len();

    // the position is either a value list or, for the compute_* forms, an
    // entity list to compare against
    if query_type.is_query()
        && matches!(
            query_type,
            NodeType::ComputeEntityConvictions
                | NodeType::ComputeEntityKlDivergences
                | NodeType::ComputeEntityDistanceContributions
        )
    {
        if let Some(&entities) = ocn.get(POSITION) {
            collect_entity_ids(entities, &mut condition.compare_entity_ids);
        }
    } else if let Some(&position) = ocn.get(POSITION) {
        if position.is_ordered_array() && position.num_child_nodes() == num_features {
            for &value in position.ordered_children() {
                condition.position_values.push(FeatureValue::from_node(value));
            }
        } else {
            condition.position_values = vec![FeatureValue::Null; num_features];
        }
    }

    let mut features = vec![FeatureAttributes::default(); num_features];

    if let Some(&weights) = ocn.get(WEIGHTS) {
        if !weights.is_null_value() {
            for (i, feature) in features.iter_mut().enumerate() {
                feature.weight = number_or(weights.ordered_children().get(i), 1.0);
            }
        }
    }

    if let Some(&types) = ocn.get(DISTANCE_TYPES) {
        if !types.is_null_value() {
            let pool = string_pool();
            for (i, feature) in features.iter_mut().enumerate() {
                if let Some(&ty) = types.ordered_children().get(i) {
                    let name = pool.string(compare::to_string_id_if_exists(ty));
                    if let Some(ft) = FeatureType::from_name(&name) {
                        feature.feature_type = ft;
                    }
                }
            }
        }
    }

    if let Some(&attributes) = ocn.get(ATTRIBUTES) {
        if !attributes.is_null_value() {
            for (i, feature) in features.iter_mut().enumerate() {
                let Some(&attribute) = attributes.ordered_children().get(i) else {
                    continue;
                };
                match feature.feature_type {
                    FeatureType::ContinuousNumericCyclic => {
                        feature.max_cyclic_difference = compare::to_number(attribute, f64::NAN);
                    }
                    ft if ft.is_nominal() => {
                        feature.nominal_count = compare::to_number(attribute, 0.0);
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(&deviations) = ocn.get(DEVIATIONS) {
        if !deviations.is_null_value() {
            for (i, feature) in features.iter_mut().enumerate() {
                let Some(&deviation) = deviations.ordered_children().get(i) else {
                    continue;
                };
                // either a number or [deviation, known_to_unknown,
                // unknown_to_unknown]
                if deviation.is_ordered_array() {
                    let inner = deviation.ordered_children();
                    feature.deviation = number_or(inner.first(), 0.0);
                    feature.known_to_unknown_difference = number_or(inner.get(1), f64::NAN);
                    feature.unknown_to_unknown_difference = number_or(inner.get(2), f64::NAN);
                } else {
                    feature.deviation = compare::to_number(deviation, 0.0);
                    if feature.deviation.is_nan() {
                        feature.deviation = 0.0;
                    }
                }
            }
        }
    }

    let mut p_value = number_or(ocn.get(MINKOWSKI_PARAMETER), 2.0);
    if p_value.is_nan() {
        p_value = 2.0;
    }
    condition.distance_evaluator.p_value = p_value;

    condition.distance_evaluator.compute_surprisal = false;
    if let Some(&transform) = ocn.get(DISTANCE_VALUE_TRANSFORM) {
        if !transform.is_null_value() {
            let name = string_pool().string(compare::to_string_id_if_exists(transform));
            if name == "surprisal" || name == "surprisal_to_prob" {
                condition.distance_evaluator.compute_surprisal = true;
            }
        }
    }

    condition.weight_label =
        compare::to_string_id_if_exists(ocn.get(ENTITY_WEIGHT_LABEL_NAME).copied().unwrap_or_default());
    condition.random_stream = seed_stream(ocn.get(RANDOM_SEED).copied());
    condition.radius_label =
        compare::to_string_id_if_exists(ocn.get(RADIUS_LABEL).copied().unwrap_or_default());

    condition.distance_evaluator.high_accuracy = false;
    if let Some(&precision) = ocn.get(NUMERICAL_PRECISION) {
        let name = string_pool().string(compare::to_string_id_if_exists(precision));
        if name == "precise" {
            condition.distance_evaluator.high_accuracy = true;
        }
    }

    // trailing parameters of the compute_* forms
    if matches!(
        query_type,
        NodeType::ComputeEntityConvictions | NodeType::ComputeEntityKlDivergences
    ) {
        condition.conviction_of_removal =
            compare::is_true(ocn.get(NUM_MINKOWSKI_DISTANCE_QUERY_PARAMETERS).copied().unwrap_or_default());
    }
    if let Some(&sorted) = ocn.get(NUM_MINKOWSKI_DISTANCE_QUERY_PARAMETERS + 1) {
        condition.return_sorted_list = compare::is_true(sorted);
    }

    // features with weight 0 are peeled off into an exists prefilter and
    // excluded from the metric
    let mut i = 0;
    while i < features.len() {
        if features[i].weight == 0.0 {
            condition.exist_labels.push(condition.position_labels[i]);
            features.remove(i);
            condition.position_labels.remove(i);
            if i < condition.position_values.len() {
                condition.position_values.remove(i);
            }
        } else {
            i += 1;
        }
    }

    condition.distance_evaluator.features = features;
    condition.distance_evaluator.initialize();
}

/// Applies a chain of conditions to the contained entities of `container`,
/// building the result in `enm`.
pub fn execute_query(
    container: &Arc<Entity>,
    conditions: &[QueryCondition],
    enm: &NodeManager,
) -> NodeRef {
    let mut entities = container.contained_entities();
    for condition in conditions {
        match apply_condition(condition, entities, enm) {
            QueryResult::Entities(surviving) => entities = surviving,
            QueryResult::Value(value) => return value,
        }
    }

    // no aggregate terminated the chain: return the surviving ids
    let ids: Vec<NodeHandle> = entities
        .iter()
        .map(|e| enm.alloc_string_node(&e.id_string()))
        .collect();
    NodeRef::new(enm.alloc_list_node(&ids), true)
}

fn label_value(entity: &Entity, label: StringId) -> NodeRef {
    entity.value_at_label(label, None, false, false)
}

fn label_number(entity: &Entity, label: StringId, default: f64) -> f64 {
    compare::to_number(label_value(entity, label).node, default)
}

fn entity_weight(entity: &Entity, weight_label: StringId) -> f64 {
    if !weight_label.is_string() {
        return 1.0;
    }
    let w = label_number(entity, weight_label, 1.0);
    if w.is_nan() { 0.0 } else { w }
}

fn apply_condition(
    condition: &QueryCondition,
    entities: Vec<Arc<Entity>>,
    enm: &NodeManager,
) -> QueryResult {
    use NodeType::*;
    let query_type = condition.query_type.expect("condition missing its type");

    // the weight-0 prefilter applies before any distance work
    let entities: Vec<Arc<Entity>> = if condition.exist_labels.is_empty()
        || matches!(query_type, QueryExists | QueryNotExists)
    {
        entities
    } else {
        entities
            .into_iter()
            .filter(|e| condition.exist_labels.iter().all(|&l| e.has_label(l)))
            .collect()
    };

    match query_type {
        QueryExists => QueryResult::Entities(
            entities
                .into_iter()
                .filter(|e| condition.exist_labels.iter().all(|&l| e.has_label(l)))
                .collect(),
        ),
        QueryNotExists => QueryResult::Entities(
            entities
                .into_iter()
                .filter(|e| condition.exist_labels.iter().all(|&l| !e.has_label(l)))
                .collect(),
        ),
        QueryEquals | QueryNotEquals => {
            let want = query_type == QueryEquals;
            QueryResult::Entities(
                entities
                    .into_iter()
                    .filter(|e| {
                        condition.pairs.iter().all(|&(label, value)| {
                            let actual = label_value(e, label);
                            compare::are_deep_equal(actual.node, value) == want
                        })
                    })
                    .collect(),
            )
        }
        QueryBetween | QueryNotBetween => {
            let want = query_type == QueryBetween;
            QueryResult::Entities(
                entities
                    .into_iter()
                    .filter(|e| {
                        let actual = label_value(e, condition.single_label);
                        if actual.is_null() {
                            return false;
                        }
                        let inside = compare::is_less_than(condition.lower, actual.node, true)
                            && compare::is_less_than(actual.node, condition.upper, true);
                        inside == want
                    })
                    .collect(),
            )
        }
        QueryLessOrEqualTo | QueryGreaterOrEqualTo => QueryResult::Entities(
            entities
                .into_iter()
                .filter(|e| {
                    let actual = label_value(e, condition.single_label);
                    if actual.is_null() {
                        return false;
                    }
                    if query_type == QueryLessOrEqualTo {
                        compare::is_less_than(actual.node, condition.lower, true)
                    } else {
                        compare::is_less_than(condition.lower, actual.node, true)
                    }
                })
                .collect(),
        ),
        QueryAmong | QueryNotAmong => {
            let want = query_type == QueryAmong;
            QueryResult::Entities(
                entities
                    .into_iter()
                    .filter(|e| {
                        let actual = label_value(e, condition.single_label);
                        let found = condition
                            .values
                            .iter()
                            .any(|&v| compare::are_deep_equal(actual.node, v));
                        found == want
                    })
                    .collect(),
            )
        }
        QueryInEntityList | QueryNotInEntityList => {
            let want = query_type == QueryInEntityList;
            let set: HashSet<StringId> = condition.entity_ids.iter().copied().collect();
            QueryResult::Entities(
                entities
                    .into_iter()
                    .filter(|e| set.contains(&e.id_string_id()) == want)
                    .collect(),
            )
        }
        QueryMin | QueryMax => {
            let k = condition.max_to_retrieve.max(0.0) as usize;
            let mut valued: Vec<(Arc<Entity>, NodeRef)> = entities
                .into_iter()
                .map(|e| {
                    let v = label_value(&e, condition.single_label);
                    (e, v)
                })
                .filter(|(_, v)| !v.is_null())
                .collect();
            valued.sort_by(|a, b| {
                let ordering = compare::compare(a.1.node, b.1.node)
                    .unwrap_or(std::cmp::Ordering::Equal);
                if query_type == QueryMin {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
            valued.truncate(k);
            QueryResult::Entities(valued.into_iter().map(|(e, _)| e).collect())
        }
        QuerySum => {
            let total: f64 = entities
                .iter()
                .map(|e| {
                    label_number(e, condition.single_label, 0.0)
                        * entity_weight(e, condition.weight_label)
                })
                .filter(|v| !v.is_nan())
                .sum();
            QueryResult::Value(NodeRef::new(enm.alloc_number_node(total), true))
        }
        QueryMode => query_mode(condition, &entities, enm),
        QueryQuantile => query_quantile(condition, &entities, enm),
        QueryGeneralizedMean => {
            let p = condition.parameter;
            let mut total_weight = 0.0;
            let mut accum = 0.0;
            for e in &entities {
                let v = label_number(e, condition.single_label, f64::NAN);
                if v.is_nan() {
                    continue;
                }
                let w = entity_weight(e, condition.weight_label);
                total_weight += w;
                if p == 0.0 {
                    accum += w * v.ln();
                } else {
                    accum += w * v.powf(p);
                }
            }
            let mean = if total_weight == 0.0 {
                f64::NAN
            } else if p == 0.0 {
                (accum / total_weight).exp()
            } else {
                (accum / total_weight).powf(1.0 / p)
            };
            QueryResult::Value(NodeRef::new(enm.alloc_number_node(mean), true))
        }
        QueryMinDifference | QueryMaxDifference => {
            let mut values: Vec<f64> = entities
                .iter()
                .map(|e| label_number(e, condition.single_label, f64::NAN))
                .filter(|v| !v.is_nan())
                .collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            values.dedup();
            let mut result = f64::NAN;
            for pair in values.windows(2) {
                let gap = pair[1] - pair[0];
                if result.is_nan()
                    || (query_type == QueryMinDifference && gap < result)
                    || (query_type == QueryMaxDifference && gap > result)
                {
                    result = gap;
                }
            }
            QueryResult::Value(NodeRef::new(enm.alloc_number_node(result), true))
        }
        QueryValueMasses => query_value_masses(condition, &entities, enm),
        QuerySelect => {
            let k = condition.max_to_retrieve.max(0.0);
            let mut selected = entities;
            match condition.random_stream.clone() {
                Some(mut stream) => {
                    // random subsample without replacement
                    let take = (k as usize).min(selected.len());
                    for i in 0..take {
                        let j = i + stream.rand_size(selected.len() - i);
                        selected.swap(i, j);
                    }
                    selected.truncate(take);
                }
                None => {
                    let offset = condition.offset.min(selected.len());
                    selected.drain(..offset);
                    if k.is_finite() {
                        selected.truncate(k as usize);
                    }
                }
            }
            QueryResult::Entities(selected)
        }
        QuerySample | QueryWeightedSample => query_sample(condition, entities, enm, query_type),
        QueryWithinGeneralizedDistance | QueryNearestGeneralizedDistance => {
            query_distance(condition, entities, enm, query_type)
        }
        ComputeEntityConvictions
        | ComputeEntityKlDivergences
        | ComputeEntityDistanceContributions => {
            compute_entity_information(condition, entities, enm, query_type)
        }
        _ => QueryResult::Entities(entities),
    }
}

fn query_mode(
    condition: &QueryCondition,
    entities: &[Arc<Entity>],
    enm: &NodeManager,
) -> QueryResult {
    let mut masses: HashMap<String, (f64, NodeHandle)> = HashMap::new();
    for e in entities {
        let value = label_value(e, condition.single_label);
        let Some(key) = compare::to_string(value.node) else {
            continue;
        };
        let w = entity_weight(e, condition.weight_label);
        let entry = masses.entry(key).or_insert((0.0, value.node));
        entry.0 += w;
    }
    let mode = masses
        .into_iter()
        .max_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(std::cmp::Ordering::Equal));
    match mode {
        Some((_, (_, node))) => QueryResult::Value(enm.deep_alloc_copy(
            node,
            crate::node::manager::MetadataModifier::RemoveAll,
        )),
        None => QueryResult::Value(NodeRef::NULL),
    }
}

fn query_quantile(
    condition: &QueryCondition,
    entities: &[Arc<Entity>],
    enm: &NodeManager,
) -> QueryResult {
    let q = condition.parameter.clamp(0.0, 1.0);
    let mut values: Vec<(f64, f64)> = entities
        .iter()
        .filter_map(|e| {
            let v = label_number(e, condition.single_label, f64::NAN);
            if v.is_nan() {
                return None;
            }
            Some((v, entity_weight(e, condition.weight_label)))
        })
        .collect();
    if values.is_empty() {
        return QueryResult::Value(NodeRef::new(enm.alloc_number_node(f64::NAN), true));
    }
    values.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let total_weight: f64 = values.iter().map(|(_, w)| w).sum();
    let target = q * total_weight;
    let mut running = 0.0;
    let mut result = values[values.len() - 1].0;
    for &(v, w) in &values {
        running += w;
        if running >= target {
            result = v;
            break;
        }
    }
    QueryResult::Value(NodeRef::new(enm.alloc_number_node(result), true))
}

fn query_value_masses(
    condition: &QueryCondition,
    entities: &[Arc<Entity>],
    enm: &NodeManager,
) -> QueryResult {
    let mut masses: Vec<(String, f64)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for e in entities {
        let value = label_value(e, condition.single_label);
        let Some(key) = compare::to_string(value.node) else {
            continue;
        };
        let w = entity_weight(e, condition.weight_label);
        match index.get(&key) {
            Some(&i) => masses[i].1 += w,
            None => {
                index.insert(key.clone(), masses.len());
                masses.push((key, w));
            }
        }
    }
    let assoc = enm.alloc_node(NodeType::Assoc);
    let pool = string_pool();
    for (key, mass) in masses {
        let key_id = pool.create_reference(&key);
        assoc.set_mapped_child(key_id, enm.alloc_number_node(mass));
        pool.destroy_reference(key_id);
    }
    QueryResult::Value(NodeRef::new(assoc, true))
}

fn query_sample(
    condition: &QueryCondition,
    entities: Vec<Arc<Entity>>,
    _enm: &NodeManager,
    query_type: NodeType,
) -> QueryResult {
    if entities.is_empty() {
        return QueryResult::Entities(entities);
    }
    let k = condition.max_to_retrieve.max(0.0) as usize;
    let mut stream = condition
        .random_stream
        .clone()
        .unwrap_or_else(|| RandomStream::from_seed_string(""));

    let mut picked = Vec::with_capacity(k);
    if query_type == NodeType::QueryWeightedSample {
        let weights: Vec<f64> = entities
            .iter()
            .map(|e| entity_weight(e, condition.weight_label).max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        for _ in 0..k {
            if total <= 0.0 {
                picked.push(entities[stream.rand_size(entities.len())].clone());
                continue;
            }
            let mut target = stream.rand_full() * total;
            let mut chosen = entities.len() - 1;
            for (i, &w) in weights.iter().enumerate() {
                if target < w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            picked.push(entities[chosen].clone());
        }
    } else {
        for _ in 0..k {
            picked.push(entities[stream.rand_size(entities.len())].clone());
        }
    }
    QueryResult::Entities(picked)
}

/// Gathers an entity's position in the condition's feature space.
fn entity_position(condition: &QueryCondition, entity: &Entity) -> SmallVec<[FeatureValue; 4]> {
    condition
        .position_labels
        .iter()
        .map(|&label| FeatureValue::from_node(label_value(entity, label).node))
        .collect()
}

fn query_distance(
    condition: &QueryCondition,
    entities: Vec<Arc<Entity>>,
    enm: &NodeManager,
    query_type: NodeType,
) -> QueryResult {
    let evaluator = &condition.distance_evaluator;
    let mut distances: Vec<(Arc<Entity>, f64)> = entities
        .into_iter()
        .filter_map(|e| {
            let position = entity_position(condition, &e);
            let d = evaluator.distance(&condition.position_values, &position);
            if d.is_nan() {
                return None;
            }
            let mut limit = condition.max_distance;
            if condition.radius_label.is_string() {
                let radius = label_number(&e, condition.radius_label, 0.0);
                if !radius.is_nan() {
                    limit += radius;
                }
            }
            if d > limit {
                return None;
            }
            Some((e, d))
        })
        .collect();

    distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    if query_type == NodeType::QueryNearestGeneralizedDistance {
        let k = condition.max_to_retrieve.max(0.0) as usize;
        distances.truncate(k);
    }

    QueryResult::Value(build_entity_value_result(
        &distances,
        condition.return_sorted_list,
        enm,
    ))
}

/// Mean distance to the k nearest other entities in the group; the basis of
/// the information-theoretic aggregations.
fn distance_contributions(
    condition: &QueryCondition,
    entities: &[Arc<Entity>],
) -> Vec<f64> {
    let evaluator = &condition.distance_evaluator;
    let positions: Vec<SmallVec<[FeatureValue; 4]>> = entities
        .iter()
        .map(|e| entity_position(condition, e))
        .collect();
    let k = if condition.max_to_retrieve > 0.0 {
        condition.max_to_retrieve as usize
    } else {
        entities.len().saturating_sub(1).max(1)
    };

    (0..entities.len())
        .map(|i| {
            let mut others: Vec<f64> = (0..entities.len())
                .filter(|&j| j != i)
                .map(|j| evaluator.distance(&positions[i], &positions[j]))
                .filter(|d| !d.is_nan())
                .collect();
            others.sort_by(|a, b| a.partial_cmp(b).unwrap());
            others.truncate(k);
            if others.is_empty() {
                0.0
            } else {
                others.iter().sum::<f64>() / others.len() as f64
            }
        })
        .collect()
}

fn compute_entity_information(
    condition: &QueryCondition,
    entities: Vec<Arc<Entity>>,
    enm: &NodeManager,
    query_type: NodeType,
) -> QueryResult {
    // restrict to the requested subset when one was given
    let subset: Vec<Arc<Entity>> = if condition.compare_entity_ids.is_empty() {
        entities
    } else {
        let wanted: HashSet<StringId> = condition.compare_entity_ids.iter().copied().collect();
        entities
            .into_iter()
            .filter(|e| wanted.contains(&e.id_string_id()))
            .collect()
    };
    if subset.is_empty() {
        return QueryResult::Value(NodeRef::NULL);
    }

    let contributions = distance_contributions(condition, &subset);
    let mean: f64 = contributions.iter().sum::<f64>() / contributions.len() as f64;

    let values: Vec<(Arc<Entity>, f64)> = subset
        .into_iter()
        .zip(&contributions)
        .map(|(e, &dc)| {
            let v = match query_type {
                NodeType::ComputeEntityDistanceContributions => dc,
                NodeType::ComputeEntityConvictions => {
                    if dc == 0.0 { f64::INFINITY } else { mean / dc }
                }
                _ => {
                    // KL divergence of the contribution against the mean
                    if dc <= 0.0 || mean <= 0.0 { 0.0 } else { (dc / mean).ln().abs() }
                }
            };
            (e, v)
        })
        .collect();

    QueryResult::Value(build_entity_value_result(
        &values,
        condition.return_sorted_list,
        enm,
    ))
}

/// Builds the per-entity value output: an assoc `id -> value`, or parallel
/// `[ids, values]` vectors when a sorted list was requested.
fn build_entity_value_result(
    values: &[(Arc<Entity>, f64)],
    return_sorted_list: bool,
    enm: &NodeManager,
) -> NodeRef {
    let pool = string_pool();
    if return_sorted_list {
        let ids: Vec<NodeHandle> = values
            .iter()
            .map(|(e, _)| enm.alloc_string_node(&e.id_string()))
            .collect();
        let nums: Vec<NodeHandle> = values
            .iter()
            .map(|(_, v)| enm.alloc_number_node(*v))
            .collect();
        let list = enm.alloc_list_node(&[
            enm.alloc_list_node(&ids),
            enm.alloc_list_node(&nums),
        ]);
        NodeRef::new(list, true)
    } else {
        let assoc = enm.alloc_node(NodeType::Assoc);
        for (e, v) in values {
            let id = pool.create_reference(&e.id_string());
            assoc.set_mapped_child(id, enm.alloc_number_node(*v));
            pool.destroy_reference(id);
        }
        NodeRef::new(assoc, true)
    }
}
