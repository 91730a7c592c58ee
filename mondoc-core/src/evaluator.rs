//! In-memory evaluation of query descriptions.
//!
//! The evaluator reproduces the store's matching rules so documents filtered
//! in process and documents filtered by the store agree:
//!
//! - dotted paths fan out over arrays of embedded documents
//! - an equality against an array field matches any member
//! - `null` equality matches explicit nulls and absent fields
//! - `ne`, `nin` and negations match absent fields
//! - ordering operators only compare values of the same type class
//!
//! It backs the in-memory store and the embedded-document sub-builder.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex::{Regex, RegexBuilder};

use crate::{
    error::{OdmError, OdmResult},
    path::{get_path, lookup_all, set_path, unset_path},
    query::{AccumulatorKind, Expr, FieldOp, GroupSpec, Projection, QueryVisitor, Sort, SortDirection, like_to_regex, output_key},
};

/// Rank of a BSON value in the store's cross-type sort order.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        Bson::Decimal128(v) => v.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

/// Total order over BSON values: type rank first, then value.
pub fn compare_values(left: &Bson, right: &Bson) -> Ordering {
    let (left_rank, right_rank) = (type_rank(left), type_rank(right));
    if left_rank != right_rank {
        return left_rank.cmp(&right_rank);
    }

    match (left, right) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Symbol(a), Bson::Symbol(b)) => a.cmp(b),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Timestamp(a), Bson::Timestamp(b)) => (a.time, a.increment).cmp(&(b.time, b.increment)),
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.cmp(&b.bytes),
        (Bson::Array(a), Bson::Array(b)) => compare_sequences(a.iter(), b.iter()),
        (Bson::Document(a), Bson::Document(b)) => {
            for ((left_key, left_value), (right_key, right_value)) in a.iter().zip(b.iter()) {
                let ordering = compare_values(left_value, right_value).then_with(|| left_key.cmp(right_key));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn compare_sequences<'a>(left: impl Iterator<Item = &'a Bson>, right: impl Iterator<Item = &'a Bson>) -> Ordering {
    let left = left.collect::<Vec<_>>();
    let right = right.collect::<Vec<_>>();

    for (a, b) in left.iter().zip(right.iter()) {
        let ordering = compare_values(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left.len().cmp(&right.len())
}

/// Value equality as the store sees it: numbers compare numerically across
/// integer and floating widths, documents and arrays compare structurally.
pub fn values_equal(left: &Bson, right: &Bson) -> bool {
    match (left, right) {
        (Bson::Document(a), Bson::Document(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        (Bson::Array(a), Bson::Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y)),
        _ => type_rank(left) == type_rank(right) && compare_values(left, right) == Ordering::Equal,
    }
}

/// Evaluates [`Expr`] trees against one document.
pub struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> OdmResult<bool> {
        self.visit_expr(expr)
    }

    /// Returns `true` if `document` matches the optional filter.
    pub fn matches(document: &Document, filter: Option<&Expr>) -> OdmResult<bool> {
        match filter {
            Some(expr) => DocumentEvaluator::new(document).evaluate(expr),
            None => Ok(true),
        }
    }

    /// Clones the documents matching `expr`.
    pub fn filter_documents(
        documents: impl IntoIterator<Item = &'a Document>,
        expr: Option<&Expr>,
    ) -> OdmResult<Vec<Document>> {
        let mut matched = Vec::new();

        for document in documents {
            if Self::matches(document, expr)? {
                matched.push(document.clone());
            }
        }

        Ok(matched)
    }

    fn any_candidate(candidates: &[&Bson], test: impl Fn(&Bson) -> bool) -> bool {
        candidates.iter().any(|candidate| {
            test(candidate)
                || match candidate {
                    Bson::Array(items) => items.iter().any(&test),
                    _ => false,
                }
        })
    }

    fn equals(candidates: &[&Bson], value: &Bson) -> bool {
        if matches!(value, Bson::Null) && candidates.is_empty() {
            return true;
        }

        Self::any_candidate(candidates, |candidate| values_equal(candidate, value))
    }

    fn pattern(field: &str, op: &FieldOp, value: &Bson) -> OdmResult<Regex> {
        let source = value.as_str().ok_or_else(|| {
            OdmError::operation(
                "where",
                format!("operator `{}` on `{field}` requires a string pattern", op.keyword()),
            )
        })?;

        let (pattern, insensitive) = match op {
            FieldOp::Like => (like_to_regex(source), false),
            FieldOp::ILike => (like_to_regex(source), true),
            _ => (source.to_string(), false),
        };

        RegexBuilder::new(&pattern)
            .case_insensitive(insensitive)
            .build()
            .map_err(|e| OdmError::operation("where", format!("invalid regex on `{field}`: {e}")))
    }
}

impl<'a> QueryVisitor for DocumentEvaluator<'a> {
    type Output = bool;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let candidates = lookup_all(self.document, field);

        Ok(match op {
            FieldOp::Eq => Self::equals(&candidates, value),
            FieldOp::Ne => !Self::equals(&candidates, value),
            FieldOp::In | FieldOp::Nin => {
                let Bson::Array(values) = value else {
                    return Err(OdmError::operation("where", format!("`{}` on `{field}` requires an array", op.keyword())));
                };
                let found = values.iter().any(|value| Self::equals(&candidates, value));
                if *op == FieldOp::In { found } else { !found }
            }
            FieldOp::All => {
                let Bson::Array(values) = value else {
                    return Err(OdmError::operation("where", format!("`all` on `{field}` requires an array")));
                };
                !values.is_empty() && values.iter().all(|value| Self::equals(&candidates, value))
            }
            FieldOp::Exists => !candidates.is_empty() == value.as_bool().unwrap_or(true),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => Self::any_candidate(&candidates, |candidate| {
                if type_rank(candidate) != type_rank(value) {
                    return false;
                }
                let ordering = compare_values(candidate, value);
                match op {
                    FieldOp::Gt => ordering == Ordering::Greater,
                    FieldOp::Gte => ordering != Ordering::Less,
                    FieldOp::Lt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                }
            }),
            FieldOp::Regex | FieldOp::Like | FieldOp::ILike => {
                let regex = Self::pattern(field, op, value)?;
                Self::any_candidate(&candidates, |candidate| match candidate {
                    Bson::String(text) => regex.is_match(text),
                    _ => false,
                })
            }
        })
    }
}

/// Sorts documents in place by the given keys; absent fields sort as `null`.
pub fn sort_documents(documents: &mut [Document], sort: &[Sort]) {
    if sort.is_empty() {
        return;
    }

    documents.sort_by(|left, right| compare_by_keys(left, right, sort));
}

/// Compares two documents by sort keys.
pub fn compare_by_keys(left: &Document, right: &Document, sort: &[Sort]) -> Ordering {
    for key in sort {
        let a = get_path(left, &key.field).unwrap_or(&Bson::Null);
        let b = get_path(right, &key.field).unwrap_or(&Bson::Null);
        let ordering = match key.direction {
            SortDirection::Asc => compare_values(a, b),
            SortDirection::Desc => compare_values(b, a),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

/// Applies a projection; inclusion projections always keep `_id`.
pub fn project_document(document: &Document, projection: &Projection) -> OdmResult<Document> {
    match projection {
        Projection::Include(fields) => {
            let mut projected = Document::new();
            if let Some(id) = document.get("_id") {
                projected.insert("_id", id.clone());
            }
            for field in fields {
                if let Some(value) = get_path(document, field) {
                    set_path(&mut projected, field, value.clone())?;
                }
            }
            Ok(projected)
        }
        Projection::Exclude(fields) => {
            let mut projected = document.clone();
            for field in fields {
                unset_path(&mut projected, field);
            }
            Ok(projected)
        }
    }
}

/// Groups documents according to `group`, in first-seen key order.
pub fn group_documents<'a>(
    documents: impl IntoIterator<Item = &'a Document>,
    group: &GroupSpec,
) -> OdmResult<Vec<Document>> {
    let mut buckets: Vec<(Vec<Bson>, Vec<&Document>)> = Vec::new();

    for document in documents {
        let key = group
            .keys
            .iter()
            .map(|path| get_path(document, path).cloned().unwrap_or(Bson::Null))
            .collect::<Vec<_>>();

        match buckets
            .iter_mut()
            .find(|(existing, _)| existing.iter().zip(key.iter()).all(|(a, b)| values_equal(a, b)))
        {
            Some((_, members)) => members.push(document),
            None => buckets.push((key, vec![document])),
        }
    }

    let mut rows = Vec::with_capacity(buckets.len());
    for (key, members) in buckets {
        let mut row = Document::new();
        for (path, value) in group.keys.iter().zip(key) {
            row.insert(output_key(path), value);
        }
        row.insert("count", members.len() as i64);

        for accumulator in &group.accumulators {
            let values = members
                .iter()
                .filter_map(|member| get_path(member, &accumulator.field))
                .filter(|value| !matches!(value, Bson::Null))
                .collect::<Vec<_>>();
            row.insert(accumulator.alias.clone(), accumulate(accumulator.kind, &values));
        }

        if DocumentEvaluator::matches(&row, group.having.as_ref())? {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn accumulate(kind: AccumulatorKind, values: &[&Bson]) -> Bson {
    let numbers = values.iter().filter_map(|value| as_number(value)).collect::<Vec<_>>();

    match kind {
        AccumulatorKind::Sum => {
            let all_integers = values.iter().all(|value| matches!(value, Bson::Int32(_) | Bson::Int64(_)));
            if all_integers {
                Bson::Int64(values.iter().filter_map(|value| value.as_i64().or(value.as_i32().map(i64::from))).sum())
            } else {
                Bson::Double(numbers.iter().sum())
            }
        }
        AccumulatorKind::Avg => match numbers.len() {
            0 => Bson::Null,
            n => Bson::Double(numbers.iter().sum::<f64>() / n as f64),
        },
        AccumulatorKind::Min => values
            .iter()
            .copied()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Bson::Null),
        AccumulatorKind::Max => values
            .iter()
            .copied()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Bson::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Accumulator, Filter};
    use bson::doc;

    fn eval(document: &Document, expr: Expr) -> bool {
        DocumentEvaluator::new(document).evaluate(&expr).unwrap()
    }

    #[test]
    fn null_equality_matches_absent_fields() {
        let absent = doc! { "name": "a" };
        let null = doc! { "name": "b", "deleted_at": null };
        let set = doc! { "name": "c", "deleted_at": 5 };

        assert!(eval(&absent, Filter::eq("deleted_at", Bson::Null)));
        assert!(eval(&null, Filter::eq("deleted_at", Bson::Null)));
        assert!(!eval(&set, Filter::eq("deleted_at", Bson::Null)));
        assert!(eval(&set, Filter::ne("deleted_at", Bson::Null)));
        assert!(!eval(&absent, Filter::exists("deleted_at")));
        assert!(eval(&null, Filter::exists("deleted_at")));
    }

    #[test]
    fn negative_operators_match_absent_fields() {
        let absent = doc! {};

        assert!(eval(&absent, Filter::ne("role", "admin")));
        assert!(eval(&absent, Filter::not_in("role", ["admin"])));
        assert!(eval(&absent, Filter::eq("role", "admin").not()));
        assert!(!eval(&absent, Filter::gt("age", 1)));
    }

    #[test]
    fn equality_fans_out_over_arrays() {
        let document = doc! {
            "tags": ["rust", "db"],
            "items": [{ "sku": "a", "qty": 2 }, { "sku": "b", "qty": 9 }],
        };

        assert!(eval(&document, Filter::eq("tags", "db")));
        assert!(eval(&document, Filter::eq("items.sku", "b")));
        assert!(eval(&document, Filter::gt("items.qty", 5)));
        assert!(eval(&document, Filter::is_in("tags", ["go", "rust"])));
        assert!(eval(&document, Expr::field("tags", FieldOp::All, Bson::Array(vec!["rust".into(), "db".into()]))));
        assert!(!eval(&document, Filter::eq("items.sku", "c")));
    }

    #[test]
    fn ordering_only_compares_same_type_class() {
        let document = doc! { "age": 30, "name": "30" };

        assert!(eval(&document, Filter::gte("age", 30.0)));
        assert!(!eval(&document, Filter::gt("name", 1)));
        assert!(eval(&document, Filter::lt("name", "4")));
    }

    #[test]
    fn like_is_anchored_and_ilike_ignores_case() {
        let document = doc! { "name": "John.Smith" };

        assert!(eval(&document, Filter::like("name", "John%")));
        assert!(!eval(&document, Filter::like("name", "john%")));
        assert!(eval(&document, Expr::field("name", FieldOp::ILike, "john%")));
        assert!(!eval(&document, Filter::like("name", "John")));
        assert!(!eval(&document, Filter::like("name", "John_Smith")));
    }

    #[test]
    fn sorts_across_types_and_missing_fields() {
        let mut documents = vec![doc! { "n": 3 }, doc! {}, doc! { "n": 1.5 }, doc! { "n": "x" }];
        sort_documents(&mut documents, &[Sort { field: "n".into(), direction: SortDirection::Asc }]);

        assert_eq!(documents, vec![doc! {}, doc! { "n": 1.5 }, doc! { "n": 3 }, doc! { "n": "x" }]);
    }

    #[test]
    fn groups_in_first_seen_order_with_accumulators() {
        let documents = vec![
            doc! { "city": "Lyon", "total": 10 },
            doc! { "city": "Paris", "total": 5 },
            doc! { "city": "Lyon", "total": 2 },
        ];
        let group = GroupSpec {
            keys: vec!["city".into()],
            accumulators: vec![
                Accumulator::new(AccumulatorKind::Sum, "total"),
                Accumulator::new(AccumulatorKind::Max, "total"),
            ],
            having: Some(Filter::gt("count", 1)),
        };

        let rows = group_documents(&documents, &group).unwrap();

        assert_eq!(rows, vec![doc! { "city": "Lyon", "count": 2_i64, "sum_total": 12_i64, "max_total": 10 }]);
    }

    #[test]
    fn inclusion_projection_keeps_id() {
        let document = doc! { "_id": 1, "name": "a", "address": { "city": "x", "zip": "y" } };
        let projected = project_document(&document, &Projection::Include(vec!["address.city".into()])).unwrap();

        assert_eq!(projected, doc! { "_id": 1, "address": { "city": "x" } });
    }
}
