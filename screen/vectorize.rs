//! # Response Vectorizer
//!
//! Turns the wide person-by-item matrix into the long-format `ResponseSet` consumed by
//! the model. Validation failures are user-input errors and are surfaced immediately;
//! nothing is coerced. Persons with too few answers are excluded with a recorded reason
//! rather than dropped silently.

use crate::config::VectorizeConfig;
use crate::types::{ItemIndex, PersonIndex, Population, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// The largest category count representable in a `Response`.
const MAX_CATEGORIES: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Binary,
    Polytomous,
}

impl ItemKind {
    fn from_categories(categories: u8) -> Self {
        if categories == 2 {
            Self::Binary
        } else {
            Self::Polytomous
        }
    }

    fn admits(self, categories: u8) -> bool {
        match self {
            Self::Binary => categories == 2,
            Self::Polytomous => categories >= 3,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Polytomous => f.write_str("polytomous"),
        }
    }
}

/// Upstream metadata for an item. The category count is optional; when absent it is
/// derived from the largest observed category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDeclaration {
    pub id: String,
    pub kind: ItemKind,
    pub categories: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: String,
    /// Number of ordinal categories `K`; valid responses lie in `[0, K - 1]`.
    pub categories: u8,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub person_id: String,
    pub age: f64,
    /// Membership of the known-genuine reference population.
    pub reference: bool,
    /// Upstream eligibility, combined into `meets_inclusion` downstream.
    pub eligible: bool,
    /// One cell per item column, `None` for a missing answer.
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideMatrix {
    pub item_ids: Vec<String>,
    pub rows: Vec<WideRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: String,
    pub age: f64,
    /// The covariate entering the model (standardized age when enabled).
    pub covariate: f64,
    pub population: Population,
    pub eligible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExclusionReason {
    TooFewResponses { answered: usize, required: usize },
    MissingCovariate,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewResponses { answered, required } => {
                write!(f, "answered {answered} items, at least {required} required")
            }
            Self::MissingCovariate => f.write_str("age covariate is missing or non-finite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub person_id: String,
    pub reason: ExclusionReason,
}

#[derive(Error, Debug, PartialEq)]
pub enum VectorizeError {
    #[error("The response matrix has no item columns.")]
    NoItems,
    #[error("Item '{0}' appears more than once in the response matrix.")]
    DuplicateItem(String),
    #[error("Person '{0}' appears more than once in the response matrix.")]
    DuplicatePerson(String),
    #[error("Row for person '{person_id}' has {found} item cells, but the matrix has {expected} items.")]
    RowWidthMismatch {
        person_id: String,
        found: usize,
        expected: usize,
    },
    #[error("Person '{person_id}', item '{item_id}': value {value} is not a non-negative integer category.")]
    InvalidCategory {
        person_id: String,
        item_id: String,
        value: f64,
    },
    #[error("Person '{person_id}', item '{item_id}': category {category} is outside [0, {max}].")]
    CategoryOutOfRange {
        person_id: String,
        item_id: String,
        category: u32,
        max: u32,
    },
    #[error("Item '{item_id}' has {categories} observed categories; at least 2 are required.")]
    DegenerateItem { item_id: String, categories: u32 },
    #[error("Item '{item_id}' is declared {declared} but has {categories} categories.")]
    ItemKindMismatch {
        item_id: String,
        declared: ItemKind,
        categories: u8,
    },
    #[error("Item declaration for '{0}' does not match any column in the response matrix.")]
    UnknownDeclaration(String),
    #[error("Every person was excluded; no respondents remain.")]
    NoRespondents,
}

/// The validated, long-format training input. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSet {
    pub items: Vec<ItemMeta>,
    pub persons: Vec<PersonRecord>,
    /// Responses grouped by person, in person order.
    pub responses: Vec<Response>,
    /// `responses[person_offsets[i]..person_offsets[i + 1]]` belong to person `i`.
    pub person_offsets: Vec<usize>,
    pub exclusions: Vec<Exclusion>,
    /// Age center and scale, taken from the reference population.
    pub covariate_center: f64,
    pub covariate_scale: f64,
    /// SHA-256 over item ids, category counts and kinds.
    pub item_set_hash: String,
    /// SHA-256 over the item set and the reference persons' ages and responses.
    /// Out-of-sample respondents do not enter it.
    pub content_hash: String,
}

impl ResponseSet {
    pub fn n_items(&self) -> usize {
        self.items.len()
    }

    pub fn n_persons(&self) -> usize {
        self.persons.len()
    }

    pub fn responses_for(&self, person: PersonIndex) -> &[Response] {
        let i = person.get();
        &self.responses[self.person_offsets[i]..self.person_offsets[i + 1]]
    }

    pub fn person_index(&self, id: &str) -> Option<PersonIndex> {
        self.persons
            .iter()
            .position(|p| p.id == id)
            .map(PersonIndex::new)
    }

    pub fn persons_in(&self, population: Population) -> impl Iterator<Item = PersonIndex> + '_ {
        self.persons
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.population == population)
            .map(|(i, _)| PersonIndex::new(i))
    }
}

/// Validates the wide matrix and produces the long-format response set.
pub fn vectorize(
    matrix: &WideMatrix,
    declarations: &[ItemDeclaration],
    config: &VectorizeConfig,
) -> Result<ResponseSet, VectorizeError> {
    let n_items = matrix.item_ids.len();
    if n_items == 0 {
        return Err(VectorizeError::NoItems);
    }
    let mut seen_items = HashSet::with_capacity(n_items);
    for id in &matrix.item_ids {
        if !seen_items.insert(id.as_str()) {
            return Err(VectorizeError::DuplicateItem(id.clone()));
        }
    }
    let declared: HashMap<&str, &ItemDeclaration> =
        declarations.iter().map(|d| (d.id.as_str(), d)).collect();
    if let Some(unknown) = declarations
        .iter()
        .find(|d| !seen_items.contains(d.id.as_str()))
    {
        return Err(VectorizeError::UnknownDeclaration(unknown.id.clone()));
    }

    // Pass 1: validate every present cell and find the observed maximum per item.
    let mut observed_max = vec![0u32; n_items];
    let mut seen_persons = HashSet::with_capacity(matrix.rows.len());
    let mut cells: Vec<Vec<(usize, u32)>> = Vec::with_capacity(matrix.rows.len());
    for row in &matrix.rows {
        if !seen_persons.insert(row.person_id.as_str()) {
            return Err(VectorizeError::DuplicatePerson(row.person_id.clone()));
        }
        if row.values.len() != n_items {
            return Err(VectorizeError::RowWidthMismatch {
                person_id: row.person_id.clone(),
                found: row.values.len(),
                expected: n_items,
            });
        }
        let mut answered = Vec::new();
        for (j, value) in row.values.iter().enumerate() {
            let Some(value) = *value else {
                continue;
            };
            let category = parse_category(value).ok_or_else(|| VectorizeError::InvalidCategory {
                person_id: row.person_id.clone(),
                item_id: matrix.item_ids[j].clone(),
                value,
            })?;
            if category >= MAX_CATEGORIES {
                return Err(VectorizeError::CategoryOutOfRange {
                    person_id: row.person_id.clone(),
                    item_id: matrix.item_ids[j].clone(),
                    category,
                    max: MAX_CATEGORIES - 1,
                });
            }
            observed_max[j] = observed_max[j].max(category);
            answered.push((j, category));
        }
        cells.push(answered);
    }

    // Pass 2: settle the category count and kind of every item.
    let mut items = Vec::with_capacity(n_items);
    for (j, id) in matrix.item_ids.iter().enumerate() {
        let declaration = declared.get(id.as_str());
        let categories = match declaration.and_then(|d| d.categories) {
            Some(k) => {
                if observed_max[j] >= u32::from(k) {
                    let offender = matrix
                        .rows
                        .iter()
                        .zip(&cells)
                        .find(|(_, answered)| {
                            answered.iter().any(|&(col, c)| col == j && c >= u32::from(k))
                        })
                        .map(|(row, _)| row.person_id.clone())
                        .unwrap_or_default();
                    return Err(VectorizeError::CategoryOutOfRange {
                        person_id: offender,
                        item_id: id.clone(),
                        category: observed_max[j],
                        max: u32::from(k).saturating_sub(1),
                    });
                }
                u32::from(k)
            }
            None => observed_max[j] + 1,
        };
        if categories < 2 {
            return Err(VectorizeError::DegenerateItem {
                item_id: id.clone(),
                categories,
            });
        }
        let categories = categories as u8;
        let kind = match declaration {
            Some(d) if !d.kind.admits(categories) => {
                return Err(VectorizeError::ItemKindMismatch {
                    item_id: id.clone(),
                    declared: d.kind,
                    categories,
                });
            }
            Some(d) => d.kind,
            None => ItemKind::from_categories(categories),
        };
        items.push(ItemMeta {
            id: id.clone(),
            categories,
            kind,
        });
    }

    // Pass 3: exclusions, then the long-format responses.
    let required = config.min_responses.min(n_items);
    if required < config.min_responses {
        log::debug!(
            "Minimum responses clamped from {} to the item count {}.",
            config.min_responses,
            n_items
        );
    }
    let mut exclusions = Vec::new();
    let mut kept = Vec::with_capacity(matrix.rows.len());
    for (row, answered) in matrix.rows.iter().zip(&cells) {
        let reason = if !row.age.is_finite() {
            Some(ExclusionReason::MissingCovariate)
        } else if answered.len() < required {
            Some(ExclusionReason::TooFewResponses {
                answered: answered.len(),
                required,
            })
        } else {
            None
        };
        match reason {
            Some(reason) => {
                log::info!("Excluding person '{}': {}", row.person_id, reason);
                exclusions.push(Exclusion {
                    person_id: row.person_id.clone(),
                    reason,
                });
            }
            None => kept.push((row, answered)),
        }
    }
    if kept.is_empty() {
        return Err(VectorizeError::NoRespondents);
    }

    let (covariate_center, covariate_scale) = if config.standardize_covariate {
        let reference_ages = kept.iter().filter(|(row, _)| row.reference).map(|(row, _)| row.age);
        if reference_ages.clone().next().is_some() {
            center_and_scale(reference_ages)
        } else {
            center_and_scale(kept.iter().map(|(row, _)| row.age))
        }
    } else {
        (0.0, 1.0)
    };

    let mut persons = Vec::with_capacity(kept.len());
    let mut responses = Vec::new();
    let mut person_offsets = Vec::with_capacity(kept.len() + 1);
    person_offsets.push(0);
    for (i, (row, answered)) in kept.iter().enumerate() {
        persons.push(PersonRecord {
            id: row.person_id.clone(),
            age: row.age,
            covariate: (row.age - covariate_center) / covariate_scale,
            population: if row.reference {
                Population::Reference
            } else {
                Population::Scored
            },
            eligible: row.eligible,
        });
        responses.extend(answered.iter().map(|&(j, category)| Response {
            person: PersonIndex::new(i),
            item: ItemIndex::new(j),
            category: category as u8,
        }));
        person_offsets.push(responses.len());
    }

    let item_set_hash = hash_item_set(&items);
    let content_hash = hash_reference_content(&item_set_hash, &persons, &responses, &person_offsets);
    log::info!(
        "Vectorized {} responses from {} persons over {} items ({} excluded).",
        responses.len(),
        persons.len(),
        items.len(),
        exclusions.len()
    );

    Ok(ResponseSet {
        items,
        persons,
        responses,
        person_offsets,
        exclusions,
        covariate_center,
        covariate_scale,
        item_set_hash,
        content_hash,
    })
}

fn parse_category(value: f64) -> Option<u32> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) {
        Some(value as u32)
    } else {
        None
    }
}

fn center_and_scale(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count();
    let mean = values.clone().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 1.0);
    }
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    let sd = variance.sqrt();
    if sd > 0.0 && sd.is_finite() {
        (mean, sd)
    } else {
        (mean, 1.0)
    }
}

/// Hash identifying the item set: ids, category counts and kinds, in column order.
pub fn hash_item_set(items: &[ItemMeta]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update((item.id.len() as u64).to_le_bytes());
        hasher.update(item.id.as_bytes());
        hasher.update([item.categories]);
        hasher.update([match item.kind {
            ItemKind::Binary => 0u8,
            ItemKind::Polytomous => 1u8,
        }]);
    }
    hex::encode(hasher.finalize())
}

fn hash_reference_content(
    item_set_hash: &str,
    persons: &[PersonRecord],
    responses: &[Response],
    person_offsets: &[usize],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_set_hash.as_bytes());
    for (i, person) in persons.iter().enumerate() {
        if person.population != Population::Reference {
            continue;
        }
        let answered = &responses[person_offsets[i]..person_offsets[i + 1]];
        hasher.update((person.id.len() as u64).to_le_bytes());
        hasher.update(person.id.as_bytes());
        hasher.update(person.age.to_bits().to_le_bytes());
        hasher.update((answered.len() as u64).to_le_bytes());
        for response in answered {
            hasher.update(response.item.0.to_le_bytes());
            hasher.update([response.category]);
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, age: f64, values: &[Option<f64>]) -> WideRow {
        WideRow {
            person_id: id.to_string(),
            age,
            reference: true,
            eligible: true,
            values: values.to_vec(),
        }
    }

    fn matrix(item_ids: &[&str], rows: Vec<WideRow>) -> WideMatrix {
        WideMatrix {
            item_ids: item_ids.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    fn lenient() -> VectorizeConfig {
        VectorizeConfig {
            min_responses: 1,
            standardize_covariate: false,
        }
    }

    #[test]
    fn derives_categories_from_observed_maximum() {
        let m = matrix(
            &["a", "b"],
            vec![
                row("p1", 30.0, &[Some(0.0), Some(3.0)]),
                row("p2", 40.0, &[Some(1.0), None]),
            ],
        );
        let set = vectorize(&m, &[], &lenient()).unwrap();
        assert_eq!(set.items[0].categories, 2);
        assert_eq!(set.items[0].kind, ItemKind::Binary);
        assert_eq!(set.items[1].categories, 4);
        assert_eq!(set.items[1].kind, ItemKind::Polytomous);
        assert_eq!(set.responses.len(), 3);
        assert_eq!(set.responses_for(PersonIndex::new(1)).len(), 1);
    }

    #[test]
    fn every_response_lies_inside_its_item_range() {
        let m = matrix(
            &["a", "b", "c"],
            vec![
                row("p1", 1.0, &[Some(0.0), Some(2.0), Some(1.0)]),
                row("p2", 2.0, &[Some(1.0), None, Some(4.0)]),
                row("p3", 3.0, &[None, Some(0.0), Some(0.0)]),
            ],
        );
        let set = vectorize(&m, &[], &lenient()).unwrap();
        for r in &set.responses {
            assert!(r.category < set.items[r.item.get()].categories);
        }
    }

    #[test]
    fn rejects_fractional_and_negative_cells() {
        let m = matrix(&["a", "b"], vec![row("p1", 1.0, &[Some(0.5), Some(1.0)])]);
        assert!(matches!(
            vectorize(&m, &[], &lenient()),
            Err(VectorizeError::InvalidCategory { .. })
        ));
        let m = matrix(&["a", "b"], vec![row("p1", 1.0, &[Some(-1.0), Some(1.0)])]);
        assert!(matches!(
            vectorize(&m, &[], &lenient()),
            Err(VectorizeError::InvalidCategory { .. })
        ));
    }

    #[test]
    fn rejects_binary_declaration_with_three_categories() {
        let m = matrix(
            &["a", "b"],
            vec![
                row("p1", 1.0, &[Some(2.0), Some(1.0)]),
                row("p2", 2.0, &[Some(0.0), Some(0.0)]),
            ],
        );
        let decl = [ItemDeclaration {
            id: "a".to_string(),
            kind: ItemKind::Binary,
            categories: None,
        }];
        match vectorize(&m, &decl, &lenient()) {
            Err(VectorizeError::ItemKindMismatch {
                item_id,
                categories,
                ..
            }) => {
                assert_eq!(item_id, "a");
                assert_eq!(categories, 3);
            }
            other => panic!("Expected ItemKindMismatch, got {:?}", other),
        }
    }

    #[test]
    fn declared_category_count_bounds_observations() {
        let m = matrix(
            &["a", "b"],
            vec![
                row("p1", 1.0, &[Some(3.0), Some(1.0)]),
                row("p2", 2.0, &[Some(0.0), Some(0.0)]),
            ],
        );
        let decl = [ItemDeclaration {
            id: "a".to_string(),
            kind: ItemKind::Polytomous,
            categories: Some(3),
        }];
        match vectorize(&m, &decl, &lenient()) {
            Err(VectorizeError::CategoryOutOfRange {
                person_id, max, ..
            }) => {
                assert_eq!(person_id, "p1");
                assert_eq!(max, 2);
            }
            other => panic!("Expected CategoryOutOfRange, got {:?}", other),
        }

        let decl = [ItemDeclaration {
            id: "a".to_string(),
            kind: ItemKind::Polytomous,
            categories: Some(6),
        }];
        let set = vectorize(&m, &decl, &lenient()).unwrap();
        assert_eq!(set.items[0].categories, 6);
    }

    #[test]
    fn excludes_sparse_respondents_with_reason() {
        let item_ids: Vec<String> = (1..=10).map(|i| format!("q{i}")).collect();
        let ids: Vec<&str> = item_ids.iter().map(String::as_str).collect();
        let full: Vec<Option<f64>> = (0..10).map(|j| Some((j % 2) as f64)).collect();
        let mut sparse = vec![None; 10];
        sparse[0] = Some(1.0);
        sparse[4] = Some(0.0);
        sparse[9] = Some(1.0);
        let m = matrix(
            &ids,
            vec![row("keep", 20.0, &full), row("sparse", 30.0, &sparse)],
        );
        let set = vectorize(&m, &[], &VectorizeConfig::default()).unwrap();
        assert_eq!(set.n_persons(), 1);
        assert!(set.person_index("sparse").is_none());
        let exclusion = set.exclusions.iter().find(|e| e.person_id == "sparse").unwrap();
        assert_eq!(
            exclusion.reason,
            ExclusionReason::TooFewResponses {
                answered: 3,
                required: 5
            }
        );
    }

    #[test]
    fn standardizes_age_over_included_persons() {
        let m = matrix(
            &["a", "b"],
            vec![
                row("p1", 10.0, &[Some(0.0), Some(1.0)]),
                row("p2", 20.0, &[Some(1.0), Some(0.0)]),
                row("p3", 30.0, &[Some(1.0), Some(1.0)]),
            ],
        );
        let config = VectorizeConfig {
            min_responses: 2,
            standardize_covariate: true,
        };
        let set = vectorize(&m, &[], &config).unwrap();
        assert!((set.covariate_center - 20.0).abs() < 1e-12);
        assert!((set.covariate_scale - 10.0).abs() < 1e-12);
        assert!((set.persons[0].covariate + 1.0).abs() < 1e-12);
    }

    #[test]
    fn out_of_sample_respondents_leave_reference_covariates_and_hash_alone() {
        let reference = vec![
            row("p1", 10.0, &[Some(0.0), Some(1.0)]),
            row("p2", 20.0, &[Some(1.0), Some(0.0)]),
            row("p3", 30.0, &[Some(1.0), Some(1.0)]),
        ];
        let config = VectorizeConfig {
            min_responses: 2,
            standardize_covariate: true,
        };
        let base = vectorize(&matrix(&["a", "b"], reference.clone()), &[], &config).unwrap();

        let mut rows = reference;
        rows.insert(
            1,
            WideRow {
                reference: false,
                ..row("new", 90.0, &[Some(0.0), Some(0.0)])
            },
        );
        let extended = vectorize(&matrix(&["a", "b"], rows), &[], &config).unwrap();
        assert_eq!(extended.covariate_center, base.covariate_center);
        assert_eq!(extended.covariate_scale, base.covariate_scale);
        assert_eq!(extended.content_hash, base.content_hash);
        let p3 = extended.person_index("p3").unwrap();
        assert!((extended.persons[p3.get()].covariate - 1.0).abs() < 1e-12);
        let new = extended.person_index("new").unwrap();
        assert!((extended.persons[new.get()].covariate - 7.0).abs() < 1e-12);
    }

    #[test]
    fn item_set_hash_ignores_responses_but_content_hash_does_not() {
        let a = matrix(
            &["a", "b"],
            vec![
                row("p1", 1.0, &[Some(0.0), Some(1.0)]),
                row("p2", 2.0, &[Some(1.0), Some(0.0)]),
            ],
        );
        let mut b = a.clone();
        b.rows[0].values[0] = Some(1.0);
        b.rows[1].values[0] = Some(0.0);
        let set_a = vectorize(&a, &[], &lenient()).unwrap();
        let set_b = vectorize(&b, &[], &lenient()).unwrap();
        assert_eq!(set_a.item_set_hash, set_b.item_set_hash);
        assert_ne!(set_a.content_hash, set_b.content_hash);
        assert_eq!(set_a.item_set_hash.len(), 64);
    }

    #[test]
    fn duplicate_person_is_an_error() {
        let m = matrix(
            &["a"],
            vec![row("p1", 1.0, &[Some(0.0)]), row("p1", 2.0, &[Some(1.0)])],
        );
        assert_eq!(
            vectorize(&m, &[], &lenient()),
            Err(VectorizeError::DuplicatePerson("p1".to_string()))
        );
    }
}
