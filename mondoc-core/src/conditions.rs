//! The filter DSL shared by model queries, embedded queries and condition
//! groups.
//!
//! Every `where*` method is a construction path into the same [`Expr`] tree:
//! the two-argument equality form, the three-argument operator form, and the
//! callback form that opens a nested group. Invalid paths, operators and
//! operator/value combinations are recorded as a deferred error and surfaced
//! by the terminal method, before anything is sent to the store.
//!
//! Conditions joined with `AND` bind tighter than `OR`:
//! `where_eq(a).or_where_eq(b).where_eq(c)` reads `a OR (b AND c)`.

use bson::Bson;

use crate::{
    error::{OdmError, OdmResult},
    query::{Expr, FieldOp, IntoOperator, validate_field_path},
};

/// How a condition joins the conditions before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// Maps a logical field path to the stored path.
pub type FieldResolver = fn(&str) -> String;

fn identity(field: &str) -> String {
    field.to_string()
}

/// Accumulated conditions plus the first error met while building them.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    entries: Vec<(Connector, Expr)>,
    error: Option<OdmError>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, connector: Connector, expr: Expr) {
        self.entries.push((connector, expr));
    }

    /// Records `error` unless an earlier one is already recorded.
    pub fn fail(&mut self, error: OdmError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn error(&self) -> Option<&OdmError> {
        self.error.as_ref()
    }

    /// Returns the deferred error, if any.
    pub fn check(&self) -> OdmResult<()> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds the conditions into one expression.
    pub fn to_expr(&self) -> Option<Expr> {
        let mut runs: Vec<Vec<Expr>> = Vec::new();

        for (connector, expr) in &self.entries {
            match (connector, runs.last_mut()) {
                (Connector::And, Some(run)) => run.push(expr.clone()),
                _ => runs.push(vec![expr.clone()]),
            }
        }

        let mut runs = runs
            .into_iter()
            .map(|mut run| if run.len() == 1 { run.remove(0) } else { Expr::And(run) })
            .collect::<Vec<_>>();

        match runs.len() {
            0 => None,
            1 => runs.pop(),
            _ => Some(Expr::Or(runs)),
        }
    }
}

/// A single `field op value` triple used by [`FilterDsl::where_all`] and
/// [`FilterDsl::where_any`].
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: Bson,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::new(field, "=", value)
    }
}

/// Builds a validated leaf expression.
fn leaf(resolver: FieldResolver, field: &str, op: OdmResult<FieldOp>, value: Bson) -> OdmResult<Expr> {
    validate_field_path(field)?;
    let op = op?;
    op.check_value(field, &value)?;

    Ok(Expr::Field {
        field: resolver(field),
        op,
        value,
    })
}

fn array(values: impl IntoIterator<Item = impl Into<Bson>>) -> Bson {
    Bson::Array(values.into_iter().map(Into::into).collect())
}

/// A nested condition group opened by the callback forms of `where`.
#[derive(Debug, Clone)]
pub struct ConditionGroup {
    conditions: Conditions,
    resolver: FieldResolver,
}

impl ConditionGroup {
    pub fn new(resolver: FieldResolver) -> Self {
        Self {
            conditions: Conditions::new(),
            resolver,
        }
    }

    /// A group over unmapped field paths.
    pub fn plain() -> Self {
        Self::new(identity)
    }

    pub fn into_conditions(self) -> Conditions {
        self.conditions
    }
}

impl FilterDsl for ConditionGroup {
    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.conditions
    }

    fn field_resolver(&self) -> FieldResolver {
        self.resolver
    }
}

/// The fluent `where*` surface.
///
/// Implementors only provide access to their [`Conditions`] and, optionally, a
/// [`FieldResolver`]; every method is shared.
pub trait FilterDsl: Sized {
    fn conditions_mut(&mut self) -> &mut Conditions;

    fn field_resolver(&self) -> FieldResolver {
        identity
    }

    /// Adds a condition built from an operator and a value.
    fn push_condition(mut self, connector: Connector, field: &str, op: OdmResult<FieldOp>, value: Bson, negate: bool) -> Self {
        match leaf(self.field_resolver(), field, op, value) {
            Ok(expr) => self
                .conditions_mut()
                .push(connector, if negate { expr.not() } else { expr }),
            Err(error) => self.conditions_mut().fail(error),
        }
        self
    }

    /// Adds a pre-built expression over already-resolved paths.
    fn push_expr(mut self, connector: Connector, expr: Expr) -> Self {
        self.conditions_mut().push(connector, expr);
        self
    }

    /// Adds a list of leaves, OR-folded when `any` is set.
    fn push_leaves(mut self, connector: Connector, conditions: Vec<Condition>, any: bool) -> Self {
        let resolver = self.field_resolver();
        let built = conditions
            .into_iter()
            .map(|c| leaf(resolver, &c.field, FieldOp::parse(&c.operator), c.value))
            .collect::<OdmResult<Vec<_>>>();

        match built {
            Ok(exprs) if exprs.is_empty() => self,
            Ok(exprs) => self.push_expr(connector, if any { Expr::Or(exprs) } else { Expr::And(exprs) }),
            Err(error) => {
                self.conditions_mut().fail(error);
                self
            }
        }
    }

    /// Opens a nested group joined with `connector`.
    fn push_group(mut self, connector: Connector, build: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        let group = build(ConditionGroup::new(self.field_resolver())).into_conditions();

        if let Some(error) = group.error() {
            self.conditions_mut().fail(error.clone());
        } else if let Some(expr) = group.to_expr() {
            self.conditions_mut().push(connector, expr);
        }
        self
    }

    /// `field = value`.
    fn where_eq(self, field: &str, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Eq), value.into(), false)
    }

    /// `field <op> value`, with `op` from either operator alphabet.
    fn where_op(self, field: &str, op: impl IntoOperator, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::And, field, op.into_operator(), value.into(), false)
    }

    fn or_where_eq(self, field: &str, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Eq), value.into(), false)
    }

    fn or_where_op(self, field: &str, op: impl IntoOperator, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::Or, field, op.into_operator(), value.into(), false)
    }

    /// `NOT (field = value)`.
    fn where_not(self, field: &str, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Eq), value.into(), true)
    }

    /// `NOT (field <op> value)`.
    fn where_not_op(self, field: &str, op: impl IntoOperator, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::And, field, op.into_operator(), value.into(), true)
    }

    fn or_where_not(self, field: &str, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Eq), value.into(), true)
    }

    fn or_where_not_op(self, field: &str, op: impl IntoOperator, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::Or, field, op.into_operator(), value.into(), true)
    }

    /// `AND ( ... )`.
    fn where_group(self, build: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        self.push_group(Connector::And, build)
    }

    /// `OR ( ... )`.
    fn or_where_group(self, build: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        self.push_group(Connector::Or, build)
    }

    fn where_in(self, field: &str, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::In), array(values), false)
    }

    fn or_where_in(self, field: &str, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::In), array(values), false)
    }

    fn where_not_in(self, field: &str, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Nin), array(values), false)
    }

    fn or_where_not_in(self, field: &str, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Nin), array(values), false)
    }

    /// `low <= field <= high`.
    fn where_between(self, field: &str, low: impl Into<Bson>, high: impl Into<Bson>) -> Self {
        let (low, high) = (low.into(), high.into());
        self.where_group(|group| group.where_op(field, FieldOp::Gte, low).where_op(field, FieldOp::Lte, high))
    }

    /// `field < low OR field > high`.
    fn where_not_between(self, field: &str, low: impl Into<Bson>, high: impl Into<Bson>) -> Self {
        let (low, high) = (low.into(), high.into());
        self.where_group(|group| group.where_op(field, FieldOp::Lt, low).or_where_op(field, FieldOp::Gt, high))
    }

    /// The field is `null` or absent.
    fn where_null(self, field: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Eq), Bson::Null, false)
    }

    fn or_where_null(self, field: &str) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Eq), Bson::Null, false)
    }

    /// The field is present and not `null`.
    fn where_not_null(self, field: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Ne), Bson::Null, false)
    }

    fn or_where_not_null(self, field: &str) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Ne), Bson::Null, false)
    }

    fn where_exists(self, field: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Exists), Bson::Boolean(true), false)
    }

    fn where_not_exists(self, field: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Exists), Bson::Boolean(false), false)
    }

    /// Pattern match where `%` is the only wildcard.
    fn where_like(self, field: &str, pattern: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Like), Bson::String(pattern.into()), false)
    }

    fn or_where_like(self, field: &str, pattern: &str) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::Like), Bson::String(pattern.into()), false)
    }

    /// Case-insensitive [`FilterDsl::where_like`].
    fn where_ilike(self, field: &str, pattern: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::ILike), Bson::String(pattern.into()), false)
    }

    fn or_where_ilike(self, field: &str, pattern: &str) -> Self {
        self.push_condition(Connector::Or, field, Ok(FieldOp::ILike), Bson::String(pattern.into()), false)
    }

    fn where_regex(self, field: &str, pattern: &str) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::Regex), Bson::String(pattern.into()), false)
    }

    /// The array field contains `value`.
    fn where_array_contains(self, field: &str, value: impl Into<Bson>) -> Self {
        self.push_condition(Connector::And, field, Ok(FieldOp::All), Bson::Array(vec![value.into()]), false)
    }

    /// AND-combines a list of conditions.
    fn where_all(self, conditions: Vec<Condition>) -> Self {
        self.push_leaves(Connector::And, conditions, false)
    }

    /// OR-combines a list of conditions.
    fn where_any(self, conditions: Vec<Condition>) -> Self {
        self.push_leaves(Connector::And, conditions, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;

    #[test]
    fn and_binds_tighter_than_or() {
        let group = ConditionGroup::plain()
            .where_eq("status", "active")
            .or_where_eq("role", "admin")
            .where_eq("verified", true);

        assert_eq!(
            group.into_conditions().to_expr(),
            Some(Expr::Or(vec![
                Filter::eq("status", "active"),
                Expr::And(vec![Filter::eq("role", "admin"), Filter::eq("verified", true)]),
            ])),
        );
    }

    #[test]
    fn callback_groups_nest() {
        let conditions = ConditionGroup::plain()
            .where_eq("a", 1)
            .where_group(|g| g.where_eq("b", 2).or_where_eq("c", 3))
            .into_conditions();

        assert_eq!(
            conditions.to_expr(),
            Some(Expr::And(vec![
                Filter::eq("a", 1),
                Expr::Or(vec![Filter::eq("b", 2), Filter::eq("c", 3)]),
            ])),
        );
    }

    #[test]
    fn shorthands_build_expected_leaves() {
        let conditions = ConditionGroup::plain()
            .where_between("age", 18, 30)
            .where_not_null("email")
            .where_any(vec![Condition::eq("city", "Lyon"), Condition::new("score", ">", 3)])
            .into_conditions();

        assert_eq!(
            conditions.to_expr(),
            Some(Expr::And(vec![
                Expr::And(vec![Filter::gte("age", 18), Filter::lte("age", 30)]),
                Filter::ne("email", Bson::Null),
                Expr::Or(vec![Filter::eq("city", "Lyon"), Filter::gt("score", 3)]),
            ])),
        );
    }

    #[test]
    fn invalid_input_is_deferred() {
        let conditions = ConditionGroup::plain()
            .where_op("age", "approximately", 3)
            .where_eq("ok", 1)
            .into_conditions();

        assert!(conditions.check().is_err());

        let conditions = ConditionGroup::plain().where_in("$where", [1]).into_conditions();
        assert!(conditions.check().is_err());
    }

    #[test]
    fn resolver_maps_fields() {
        fn upper(field: &str) -> String {
            field.to_uppercase()
        }

        let conditions = ConditionGroup::new(upper).where_eq("name", "x").into_conditions();
        assert_eq!(conditions.to_expr(), Some(Filter::eq("NAME", "x")));
    }
}
