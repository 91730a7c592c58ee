//! Compilation of query descriptions into native store documents.
//!
//! [`NativeCompiler`] turns [`Expr`] trees into MongoDB filter documents; the
//! remaining functions compile sorts, projections, updates, grouping
//! pipelines, and embedded-array push-down stages.

use bson::{Bson, Document, doc};

use crate::{
    error::{OdmError, OdmResult},
    query::{
        AccumulatorKind, ElementFilter, ElementLocator, Expr, FieldOp, GroupSpec, Projection, Query,
        QueryVisitor, Sort, SortDirection, Update, UpdateOp, like_to_regex, output_key,
    },
};

/// Translates [`Expr`] trees into MongoDB query documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCompiler;

impl QueryVisitor for NativeCompiler {
    type Output = Document;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        if exprs.is_empty() {
            return Ok(Document::new());
        }

        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        if exprs.is_empty() {
            return Ok(doc! { "$nor": [{}] });
        }

        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: match op {
                FieldOp::Eq => doc! { "$eq": value },
                FieldOp::Ne => doc! { "$ne": value },
                FieldOp::Gt => doc! { "$gt": value },
                FieldOp::Gte => doc! { "$gte": value },
                FieldOp::Lt => doc! { "$lt": value },
                FieldOp::Lte => doc! { "$lte": value },
                FieldOp::In => doc! { "$in": value },
                FieldOp::Nin => doc! { "$nin": value },
                FieldOp::Exists => doc! { "$exists": value },
                FieldOp::All => doc! { "$all": value },
                FieldOp::Regex => doc! { "$regex": string_operand(field, op, value)? },
                FieldOp::Like => doc! { "$regex": like_to_regex(string_operand(field, op, value)?) },
                FieldOp::ILike => doc! {
                    "$regex": like_to_regex(string_operand(field, op, value)?),
                    "$options": "i",
                },
            }
        })
    }
}

/// Converts a skip, limit or index to the driver's signed width, clamping
/// instead of wrapping to a negative count.
pub fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn string_operand<'v>(field: &str, op: &FieldOp, value: &'v Bson) -> OdmResult<&'v str> {
    value.as_str().ok_or_else(|| {
        OdmError::operation(
            "where",
            format!("operator `{}` on `{field}` requires a string pattern", op.keyword()),
        )
    })
}

/// Compiles an optional filter; `None` matches every document.
pub fn compile_filter(filter: Option<&Expr>) -> OdmResult<Document> {
    match filter {
        Some(expr) => NativeCompiler.visit_expr(expr),
        None => Ok(Document::new()),
    }
}

/// Compiles sort keys, or `None` when there are none.
pub fn compile_sort(sort: &[Sort]) -> Option<Document> {
    if sort.is_empty() {
        return None;
    }

    let mut document = Document::new();
    for key in sort {
        document.insert(
            key.field.clone(),
            match key.direction {
                SortDirection::Asc => 1,
                SortDirection::Desc => -1,
            },
        );
    }

    Some(document)
}

/// Compiles a projection document.
pub fn compile_projection(projection: &Projection) -> Document {
    let (fields, flag) = match projection {
        Projection::Include(fields) => (fields, 1),
        Projection::Exclude(fields) => (fields, 0),
    };

    fields
        .iter()
        .map(|field| (field.clone(), Bson::Int32(flag)))
        .collect()
}

/// The native form of an [`Update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDocument {
    /// An operator document such as `{ "$set": { .. } }`.
    Operators(Document),
    /// An aggregation-pipeline update.
    Pipeline(Vec<Document>),
}

/// An update ready for dispatch: the modification plus any filter the
/// positional operator needs to locate its element.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUpdate {
    pub filter: Document,
    pub update: UpdateDocument,
}

/// Compiles `update` for documents matching `filter`.
///
/// Removing an array element by position has no operator form, so such an
/// update compiles to a single-stage pipeline and must be the only
/// modification in the request.
pub fn compile_update(filter: Option<&Expr>, update: &Update) -> OdmResult<CompiledUpdate> {
    if update.is_empty() {
        return Err(OdmError::operation("update", "update contains no modifications"));
    }

    let effective = match (filter.cloned(), update.required_filter()) {
        (Some(filter), Some(required)) => Some(filter.and(required)),
        (filter, required) => filter.or(required),
    };
    let filter = compile_filter(effective.as_ref())?;

    let positional = update.ops.iter().find_map(|op| match op {
        UpdateOp::PullElement {
            field,
            locator: ElementLocator::Index(index),
        } => Some((field, *index)),
        _ => None,
    });

    if let Some((field, index)) = positional {
        if update.ops.len() > 1 {
            return Err(OdmError::operation(
                "update",
                "removing an element by position cannot be combined with other modifications",
            ));
        }

        return Ok(CompiledUpdate {
            filter,
            update: UpdateDocument::Pipeline(vec![remove_at_stage(field, index)]),
        });
    }

    let mut set = Document::new();
    let mut unset = Document::new();
    let mut push = Document::new();
    let mut pull = Document::new();

    for op in &update.ops {
        match op {
            UpdateOp::Set(field, value) => {
                set.insert(field.clone(), value.clone());
            }
            UpdateOp::Unset(field) => {
                unset.insert(field.clone(), "");
            }
            UpdateOp::Push(field, value) => {
                push.insert(field.clone(), value.clone());
            }
            UpdateOp::SetElement { field, locator, value } => {
                let path = match locator {
                    ElementLocator::Index(index) => format!("{field}.{index}"),
                    ElementLocator::Id(_) => format!("{field}.$"),
                };
                set.insert(path, value.clone());
            }
            UpdateOp::PullElement { field, locator } => {
                if let ElementLocator::Id(id) = locator {
                    pull.insert(field.clone(), doc! { "_id": id.clone() });
                }
            }
        }
    }

    let mut operators = Document::new();
    for (operator, body) in [("$set", set), ("$unset", unset), ("$push", push), ("$pull", pull)] {
        if !body.is_empty() {
            operators.insert(operator, body);
        }
    }

    Ok(CompiledUpdate {
        filter,
        update: UpdateDocument::Operators(operators),
    })
}

fn remove_at_stage(field: &str, index: usize) -> Document {
    let array = format!("${field}");
    let index = saturating_i64(index);

    doc! {
        "$set": {
            field: {
                "$map": {
                    "input": {
                        "$filter": {
                            "input": { "$range": [0, { "$size": { "$ifNull": [array.clone(), []] } }] },
                            "as": "idx",
                            "cond": { "$ne": ["$$idx", index] },
                        }
                    },
                    "as": "idx",
                    "in": { "$arrayElemAt": [array, "$$idx"] },
                }
            }
        }
    }
}

/// Compiles a read that needs the aggregation framework: queries carrying
/// embedded-array filters.
pub fn compile_find_pipeline(query: &Query) -> OdmResult<Vec<Document>> {
    let mut pipeline = vec![doc! { "$match": compile_filter(query.filter.as_ref())? }];

    if let Some(sort) = compile_sort(&query.sort) {
        pipeline.push(doc! { "$sort": sort });
    }
    if let Some(offset) = query.offset {
        pipeline.push(doc! { "$skip": saturating_i64(offset) });
    }
    if let Some(limit) = query.limit {
        pipeline.push(doc! { "$limit": saturating_i64(limit) });
    }
    if !query.element_filters.is_empty() {
        pipeline.push(compile_element_filters(&query.element_filters)?);
    }
    if let Some(projection) = &query.projection {
        pipeline.push(doc! { "$project": compile_projection(projection) });
    }

    Ok(pipeline)
}

/// Compiles embedded-array filters into one `$set` stage of `$filter`s.
pub fn compile_element_filters(filters: &[ElementFilter]) -> OdmResult<Document> {
    let mut fields = Document::new();

    for filter in filters {
        let condition = ElementExprCompiler::new("el").visit_expr(&filter.filter)?;
        fields.insert(
            filter.field.clone(),
            doc! {
                "$filter": {
                    "input": { "$ifNull": [format!("${}", filter.field), []] },
                    "as": "el",
                    "cond": condition,
                }
            },
        );
    }

    Ok(doc! { "$set": fields })
}

/// Compiles an [`Expr`] into an aggregation expression evaluated against a
/// bound variable, matching the query-language semantics of the filter
/// compiled by [`NativeCompiler`]: absent fields equal `null`, ordering only
/// compares values of the same type, and scalars match array members.
pub struct ElementExprCompiler {
    variable: String,
}

impl ElementExprCompiler {
    pub fn new(variable: &str) -> Self {
        Self {
            variable: variable.to_string(),
        }
    }

    fn path(&self, field: &str) -> String {
        format!("$${}.{field}", self.variable)
    }

    fn equals(path: &str, value: &Bson) -> Bson {
        match value {
            Bson::Null => Bson::Document(doc! { "$lte": [path, Bson::Null] }),
            _ => Bson::Document(doc! {
                "$or": [
                    { "$eq": [path, value.clone()] },
                    {
                        "$cond": [
                            { "$isArray": path },
                            { "$in": [value.clone(), path] },
                            false,
                        ]
                    },
                ]
            }),
        }
    }

    fn member_of(path: &str, values: &Bson) -> OdmResult<Bson> {
        let Bson::Array(items) = values else {
            return Err(OdmError::operation("where", "membership operators require an array"));
        };

        Ok(Bson::Document(doc! {
            "$or": items.iter().map(|value| Self::equals(path, value)).collect::<Vec<_>>(),
        }))
    }

    /// Applies `test` to the value at `path`, or to each member when the
    /// value is an array.
    fn any_member(path: &str, test: impl Fn(&str) -> Bson) -> Bson {
        Bson::Document(doc! {
            "$cond": [
                { "$isArray": path },
                { "$anyElementTrue": [{ "$map": { "input": path, "as": "member", "in": test("$$member") } }] },
                test(path),
            ]
        })
    }

    fn ordered(path: &str, operator: &str, value: &Bson) -> Bson {
        Self::any_member(path, |operand| {
            let same_type = match value {
                Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
                    doc! { "$isNumber": operand }
                }
                _ => doc! { "$eq": [{ "$type": operand }, { "$type": value.clone() }] },
            };

            Bson::Document(doc! {
                "$and": [same_type, { operator: [operand, value.clone()] }],
            })
        })
    }

    fn matches(path: &str, pattern: String, options: &str) -> Bson {
        Self::any_member(path, |operand| {
            Bson::Document(doc! {
                "$cond": [
                    { "$eq": [{ "$type": operand }, "string"] },
                    { "$regexMatch": { "input": operand, "regex": pattern.as_str(), "options": options } },
                    false,
                ]
            })
        })
    }
}

impl QueryVisitor for ElementExprCompiler {
    type Output = Bson;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(Bson::Document(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        }))
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(Bson::Document(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        }))
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(Bson::Document(doc! {
            "$not": [self.visit_expr(expr)?],
        }))
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let path = self.path(field);

        Ok(match op {
            FieldOp::Eq => Self::equals(&path, value),
            FieldOp::Ne => Bson::Document(doc! { "$not": [Self::equals(&path, value)] }),
            FieldOp::Gt => Self::ordered(&path, "$gt", value),
            FieldOp::Gte => Self::ordered(&path, "$gte", value),
            FieldOp::Lt => Self::ordered(&path, "$lt", value),
            FieldOp::Lte => Self::ordered(&path, "$lte", value),
            FieldOp::In => Self::member_of(&path, value)?,
            FieldOp::Nin => Bson::Document(doc! { "$not": [Self::member_of(&path, value)?] }),
            FieldOp::Exists => {
                let present = doc! { "$ne": [{ "$type": path.clone() }, "missing"] };
                if value.as_bool().unwrap_or(true) {
                    Bson::Document(present)
                } else {
                    Bson::Document(doc! { "$not": [present] })
                }
            }
            FieldOp::All => {
                let Bson::Array(items) = value else {
                    return Err(OdmError::operation("where", "`all` requires an array"));
                };
                Bson::Document(doc! {
                    "$and": items.iter().map(|item| Self::equals(&path, item)).collect::<Vec<_>>(),
                })
            }
            FieldOp::Regex => Self::matches(&path, string_operand(field, op, value)?.to_string(), ""),
            FieldOp::Like => Self::matches(&path, like_to_regex(string_operand(field, op, value)?), ""),
            FieldOp::ILike => Self::matches(&path, like_to_regex(string_operand(field, op, value)?), "i"),
        })
    }
}

/// Compiles a grouped read into an aggregation pipeline.
pub fn compile_group(query: &Query, group: &GroupSpec) -> OdmResult<Vec<Document>> {
    let mut pipeline = vec![doc! { "$match": compile_filter(query.filter.as_ref())? }];

    let mut id = Document::new();
    for key in &group.keys {
        id.insert(output_key(key), format!("${key}"));
    }

    let mut stage = doc! {
        "_id": id,
        "count": { "$sum": 1 },
    };
    for accumulator in &group.accumulators {
        let operator = match accumulator.kind {
            AccumulatorKind::Sum => "$sum",
            AccumulatorKind::Avg => "$avg",
            AccumulatorKind::Min => "$min",
            AccumulatorKind::Max => "$max",
        };
        stage.insert(
            accumulator.alias.clone(),
            doc! { operator: format!("${}", accumulator.field) },
        );
    }
    pipeline.push(doc! { "$group": stage });

    let mut project = doc! { "_id": 0, "count": 1 };
    for key in &group.keys {
        let key = output_key(key);
        project.insert(key.clone(), format!("$_id.{key}"));
    }
    for accumulator in &group.accumulators {
        project.insert(accumulator.alias.clone(), 1);
    }
    pipeline.push(doc! { "$project": project });

    if let Some(having) = &group.having {
        pipeline.push(doc! { "$match": NativeCompiler.visit_expr(having)? });
    }
    if let Some(sort) = compile_sort(&query.sort) {
        pipeline.push(doc! { "$sort": sort });
    }
    if let Some(offset) = query.offset {
        pipeline.push(doc! { "$skip": saturating_i64(offset) });
    }
    if let Some(limit) = query.limit {
        pipeline.push(doc! { "$limit": saturating_i64(limit) });
    }

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use std::{cmp::Ordering, collections::HashMap};

    use super::*;
    use crate::{
        evaluator::{DocumentEvaluator, compare_values, values_equal},
        query::{Accumulator, Filter},
    };

    /// Evaluates the aggregation operators [`ElementExprCompiler`] emits,
    /// with the server's semantics for missing values.
    struct Aggregation {
        variables: HashMap<String, Bson>,
    }

    impl Aggregation {
        fn bind(name: &str, value: Bson) -> Self {
            Self {
                variables: HashMap::from([(name.to_string(), value)]),
            }
        }

        fn truthy(value: &Option<Bson>) -> bool {
            match value {
                None | Some(Bson::Null) => false,
                Some(Bson::Boolean(b)) => *b,
                Some(Bson::Int32(n)) => *n != 0,
                Some(Bson::Int64(n)) => *n != 0,
                Some(Bson::Double(n)) => *n != 0.0,
                Some(_) => true,
            }
        }

        fn type_name(value: &Option<Bson>) -> &'static str {
            match value {
                None => "missing",
                Some(Bson::Null) => "null",
                Some(Bson::String(_)) => "string",
                Some(Bson::Int32(_)) => "int",
                Some(Bson::Int64(_)) => "long",
                Some(Bson::Double(_)) => "double",
                Some(Bson::Decimal128(_)) => "decimal",
                Some(Bson::Boolean(_)) => "bool",
                Some(Bson::Array(_)) => "array",
                Some(Bson::Document(_)) => "object",
                Some(_) => "other",
            }
        }

        fn eval(&mut self, expr: &Bson) -> Option<Bson> {
            match expr {
                Bson::String(path) if path.starts_with("$$") => {
                    let (name, rest) = match path[2..].split_once('.') {
                        Some((name, rest)) => (name, Some(rest)),
                        None => (&path[2..], None),
                    };
                    let value = self.variables.get(name)?;
                    match (rest, value) {
                        (None, value) => Some(value.clone()),
                        (Some(field), Bson::Document(document)) => document.get(field).cloned(),
                        _ => None,
                    }
                }
                Bson::Array(items) => Some(Bson::Array(
                    items
                        .iter()
                        .map(|item| self.eval(item).unwrap_or(Bson::Null))
                        .collect(),
                )),
                Bson::Document(document) if document.len() == 1 && document.keys().all(|key| key.starts_with('$')) => {
                    let (operator, argument) = document.iter().next().unwrap();
                    Some(self.apply(operator, argument))
                }
                other => Some(other.clone()),
            }
        }

        fn args(&mut self, argument: &Bson) -> Vec<Option<Bson>> {
            match argument {
                Bson::Array(items) => items.iter().map(|item| self.eval(item)).collect(),
                other => vec![self.eval(other)],
            }
        }

        fn compare(args: &[Option<Bson>]) -> Ordering {
            let null = Bson::Null;
            compare_values(args[0].as_ref().unwrap_or(&null), args[1].as_ref().unwrap_or(&null))
        }

        fn apply(&mut self, operator: &str, argument: &Bson) -> Bson {
            match operator {
                "$cond" => {
                    let branches = argument.as_array().unwrap();
                    let test = self.eval(&branches[0]);
                    let chosen = if Self::truthy(&test) { &branches[1] } else { &branches[2] };
                    self.eval(chosen).unwrap_or(Bson::Null)
                }
                "$and" => Bson::Boolean(self.args(argument).iter().all(Self::truthy)),
                "$or" => Bson::Boolean(self.args(argument).iter().any(Self::truthy)),
                "$not" => Bson::Boolean(!Self::truthy(&self.args(argument)[0])),
                "$isArray" => Bson::Boolean(matches!(self.args(argument)[0], Some(Bson::Array(_)))),
                "$isNumber" => Bson::Boolean(matches!(
                    self.args(argument)[0],
                    Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_))
                )),
                "$type" => Bson::String(Self::type_name(&self.args(argument)[0]).to_string()),
                "$eq" => {
                    let args = self.args(argument);
                    Bson::Boolean(match (&args[0], &args[1]) {
                        (None, None) => true,
                        (Some(a), Some(b)) => values_equal(a, b),
                        _ => false,
                    })
                }
                "$ne" => Bson::Boolean(!Self::truthy(&Some(self.apply("$eq", argument)))),
                "$gt" => Bson::Boolean(Self::compare(&self.args(argument)) == Ordering::Greater),
                "$gte" => Bson::Boolean(Self::compare(&self.args(argument)) != Ordering::Less),
                "$lt" => Bson::Boolean(Self::compare(&self.args(argument)) == Ordering::Less),
                "$lte" => Bson::Boolean(Self::compare(&self.args(argument)) != Ordering::Greater),
                "$in" => {
                    let args = self.args(argument);
                    let Some(Bson::Array(members)) = &args[1] else {
                        panic!("$in needs an array");
                    };
                    Bson::Boolean(args[0].as_ref().is_some_and(|value| members.iter().any(|m| values_equal(value, m))))
                }
                "$anyElementTrue" => match &self.args(argument)[0] {
                    Some(Bson::Array(items)) => Bson::Boolean(items.iter().any(|item| Self::truthy(&Some(item.clone())))),
                    other => panic!("$anyElementTrue needs an array, got {other:?}"),
                },
                "$map" => {
                    let spec = argument.as_document().unwrap();
                    let Some(Bson::Array(items)) = self.eval(spec.get("input").unwrap()) else {
                        return Bson::Null;
                    };
                    let name = spec.get_str("as").unwrap().to_string();
                    let mapped = items
                        .into_iter()
                        .map(|item| {
                            self.variables.insert(name.clone(), item);
                            self.eval(spec.get("in").unwrap()).unwrap_or(Bson::Null)
                        })
                        .collect();
                    self.variables.remove(&name);
                    Bson::Array(mapped)
                }
                "$regexMatch" => {
                    let spec = argument.as_document().unwrap();
                    let Some(Bson::String(input)) = self.eval(spec.get("input").unwrap()) else {
                        panic!("$regexMatch needs a string input");
                    };
                    let pattern = regex::RegexBuilder::new(spec.get_str("regex").unwrap())
                        .case_insensitive(spec.get_str("options").unwrap_or("").contains('i'))
                        .build()
                        .unwrap();
                    Bson::Boolean(pattern.is_match(&input))
                }
                other => panic!("unsupported operator {other}"),
            }
        }
    }

    fn elements() -> Vec<Document> {
        vec![
            doc! { "scores": [1, 9], "tags": ["red", "blue"], "city": "Oslo", "floor": 3 },
            doc! { "scores": 4, "tags": "green", "city": "Bergen", "floor": 1 },
            doc! { "scores": [], "floor": 2 },
            doc! { "scores": ["7"], "tags": [1], "city": null, "floor": 7.5 },
            doc! { "scores": 12_i64, "tags": ["Red"], "city": "Trondheim" },
        ]
    }

    #[test]
    fn element_expressions_select_what_the_evaluator_selects() {
        let filters = vec![
            ("scores > 5", Filter::gt("scores", 5)),
            ("scores >= 4", Filter::gte("scores", 4)),
            ("scores < 2", Filter::lt("scores", 2)),
            ("scores <= 1", Filter::lte("scores", 1)),
            ("scores between 5 and 10", Filter::gte("scores", 5).and(Filter::lte("scores", 10))),
            ("scores > \"5\"", Filter::gt("scores", "5")),
            ("scores = 9", Filter::eq("scores", 9)),
            ("scores != 9", Filter::ne("scores", 9)),
            ("scores in", Expr::field("scores", FieldOp::In, vec![1, 12])),
            ("scores nin", Expr::field("scores", FieldOp::Nin, vec![4])),
            ("tags like", Expr::field("tags", FieldOp::Like, "%ed")),
            ("tags ilike", Expr::field("tags", FieldOp::ILike, "r%")),
            ("tags regex", Expr::field("tags", FieldOp::Regex, "^bl")),
            ("tags all", Expr::field("tags", FieldOp::All, vec!["red", "blue"])),
            ("not tags like", Expr::field("tags", FieldOp::Like, "%e%").not()),
            ("city = null", Filter::eq("city", Bson::Null)),
            ("city = Oslo or floor < 2", Filter::eq("city", "Oslo").or(Filter::lt("floor", 2))),
            ("floor > 2", Filter::gt("floor", 2)),
            ("floor missing", Expr::field("floor", FieldOp::Exists, false)),
            ("floor present", Expr::field("floor", FieldOp::Exists, true)),
        ];

        for (label, filter) in filters {
            let condition = ElementExprCompiler::new("el").visit_expr(&filter).unwrap();

            for element in elements() {
                let expected = DocumentEvaluator::matches(&element, Some(&filter)).unwrap();
                let compiled = Aggregation::bind("el", Bson::Document(element.clone())).eval(&condition);
                assert_eq!(
                    Aggregation::truthy(&compiled),
                    expected,
                    "`{label}` disagrees on {element}",
                );
            }
        }
    }

    #[test]
    fn ordering_and_patterns_fan_out_over_array_members() {
        let ordered = ElementExprCompiler::new("el")
            .visit_expr(&Filter::gt("scores", 5))
            .unwrap();
        let like = ElementExprCompiler::new("el")
            .visit_expr(&Expr::field("tags", FieldOp::Like, "%ed"))
            .unwrap();

        for (compiled, path) in [(ordered, "$$el.scores"), (like, "$$el.tags")] {
            let branches = compiled.as_document().unwrap().get_array("$cond").unwrap();
            assert_eq!(branches[0], Bson::Document(doc! { "$isArray": path }));

            let any = branches[1].as_document().unwrap().get_array("$anyElementTrue").unwrap();
            let map = any[0].as_document().unwrap().get_document("$map").unwrap();
            assert_eq!(map.get_str("input").unwrap(), path);
            assert_eq!(map.get_str("as").unwrap(), "member");
        }

        let element = doc! { "scores": [1, 9] };
        let condition = ElementExprCompiler::new("el")
            .visit_expr(&Filter::gt("scores", 5))
            .unwrap();
        assert!(Aggregation::truthy(
            &Aggregation::bind("el", Bson::Document(element)).eval(&condition)
        ));
    }

    #[test]
    fn unbounded_slices_clamp_instead_of_wrapping() {
        let pipeline = compile_find_pipeline(&Query::new().offset(usize::MAX).limit(usize::MAX)).unwrap();

        assert_eq!(pipeline[1], doc! { "$skip": i64::MAX });
        assert_eq!(pipeline[2], doc! { "$limit": i64::MAX });
        assert_eq!(saturating_i64(42), 42);
    }

    #[test]
    fn symbolic_and_keyword_operators_compile_identically() {
        for (symbol, keyword) in [("=", "eq"), ("!=", "ne"), (">", "gt"), (">=", "gte"), ("<", "lt"), ("<=", "lte")] {
            let left = Expr::field("age", FieldOp::parse(symbol).unwrap(), 18);
            let right = Expr::field("age", FieldOp::parse(keyword).unwrap(), 18);

            assert_eq!(
                NativeCompiler.visit_expr(&left).unwrap(),
                NativeCompiler.visit_expr(&right).unwrap(),
            );
        }

        let compiled = NativeCompiler
            .visit_expr(&Expr::field("age", FieldOp::parse(">=").unwrap(), 18))
            .unwrap();
        assert_eq!(compiled, doc! { "age": { "$gte": 18 } });
    }

    #[test]
    fn like_compiles_to_an_escaped_anchored_regex() {
        let like = NativeCompiler
            .visit_expr(&Expr::field("name", FieldOp::Like, "J.%"))
            .unwrap();
        let ilike = NativeCompiler
            .visit_expr(&Expr::field("name", FieldOp::ILike, "j%"))
            .unwrap();

        assert_eq!(like, doc! { "name": { "$regex": "^J\\..*$" } });
        assert_eq!(ilike, doc! { "name": { "$regex": "^j.*$", "$options": "i" } });
    }

    #[test]
    fn logical_operators_compile_to_native_combinators() {
        let expr = Filter::eq("status", "active")
            .or(Filter::eq("role", "admin"))
            .and(Filter::eq("deleted", true).not());

        assert_eq!(
            NativeCompiler.visit_expr(&expr).unwrap(),
            doc! {
                "$and": [
                    { "$or": [{ "status": { "$eq": "active" } }, { "role": { "$eq": "admin" } }] },
                    { "$nor": [{ "deleted": { "$eq": true } }] },
                ]
            },
        );
    }

    #[test]
    fn updates_compile_to_operator_documents() {
        let update = Update::new()
            .set("name", "Ada")
            .unset("nickname")
            .set_element("addresses", ElementLocator::Id(Bson::Int32(3)), doc! { "_id": 3, "city": "Paris" });

        let compiled = compile_update(Some(&Filter::eq("_id", 1)), &update).unwrap();

        assert_eq!(
            compiled.filter,
            doc! { "$and": [{ "_id": { "$eq": 1 } }, { "addresses._id": { "$eq": 3 } }] },
        );
        assert_eq!(
            compiled.update,
            UpdateDocument::Operators(doc! {
                "$set": { "name": "Ada", "addresses.$": { "_id": 3, "city": "Paris" } },
                "$unset": { "nickname": "" },
            }),
        );
    }

    #[test]
    fn positional_removal_compiles_to_a_pipeline() {
        let update = Update::new().pull_element("items", ElementLocator::Index(1));
        let compiled = compile_update(None, &update).unwrap();

        assert!(matches!(compiled.update, UpdateDocument::Pipeline(ref stages) if stages.len() == 1));
        assert!(compile_update(None, &update.clone().set("a", 1)).is_err());
    }

    #[test]
    fn group_pipeline_flattens_keys_and_applies_having() {
        let group = GroupSpec {
            keys: vec!["address.city".into()],
            accumulators: vec![Accumulator::new(AccumulatorKind::Sum, "total")],
            having: Some(Filter::gt("count", 1)),
        };

        let pipeline = compile_group(&Query::new(), &group).unwrap();

        assert_eq!(pipeline[1], doc! {
            "$group": {
                "_id": { "address_city": "$address.city" },
                "count": { "$sum": 1 },
                "sum_total": { "$sum": "$total" },
            }
        });
        assert_eq!(pipeline[3], doc! { "$match": { "count": { "$gt": 1 } } });
    }

    #[test]
    fn element_filters_compile_to_filter_stages() {
        let stage = compile_element_filters(&[crate::query::ElementFilter {
            field: "addresses".into(),
            filter: Filter::eq("city", Bson::Null),
        }])
        .unwrap();

        assert_eq!(stage, doc! {
            "$set": {
                "addresses": {
                    "$filter": {
                        "input": { "$ifNull": ["$addresses", []] },
                        "as": "el",
                        "cond": { "$lte": ["$$el.city", null] },
                    }
                }
            }
        });
    }
}
