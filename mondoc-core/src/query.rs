//! Condition AST and query description types.
//!
//! This module holds the backend-independent description of a query: the
//! [`Expr`] condition tree, sort and projection specifications, grouping, and
//! update operations. The fluent [`QueryBuilder`](crate::builder::QueryBuilder)
//! produces these values; backends consume them either by compiling them to
//! native documents ([`crate::compile`]) or by evaluating them in memory
//! ([`crate::evaluator`]).
//!
//! # Operators
//!
//! [`FieldOp::parse`] is the single operator table. It accepts both the
//! symbolic alphabet (`=`, `!=`, `>`, `>=`, `<`, `<=`) and the store keyword
//! alphabet (`eq`, `ne`, `gt`, `gte`, `lt`, `lte`, `in`, `nin`, `exists`,
//! `regex`), so both spellings of a comparison produce the same [`FieldOp`].
//!
//! ```ignore
//! use mondoc::query::{FieldOp, Filter};
//!
//! assert_eq!(FieldOp::parse(">=")?, FieldOp::parse("gte")?);
//!
//! let expr = Filter::eq("status", "active").and(Filter::gt("age", 18));
//! ```

use bson::Bson;

use crate::error::{OdmError, OdmResult};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    /// Parses `asc`/`desc` (case-insensitive) or `1`/`-1`.
    pub fn parse(value: &str) -> OdmResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" | "1" => Ok(SortDirection::Asc),
            "desc" | "descending" | "-1" => Ok(SortDirection::Desc),
            other => Err(OdmError::operation("orderBy", format!("unknown sort direction `{other}`"))),
        }
    }
}

/// Sort specification for query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    /// The field path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOp {
    /// Equal to. Matches array fields containing the value.
    Eq,
    /// Not equal to. Matches documents where the field is absent.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Equal to any value of the given array.
    In,
    /// Equal to none of the values of the given array.
    Nin,
    /// The field is present (`true`) or absent (`false`).
    Exists,
    /// The string field matches the regular expression.
    Regex,
    /// SQL-style pattern where `%` is the only wildcard.
    Like,
    /// Case-insensitive [`FieldOp::Like`].
    ILike,
    /// The array field contains every value of the given array.
    All,
}

impl FieldOp {
    /// Resolves an operator from either alphabet.
    ///
    /// Keyword operators are case-insensitive and may carry a leading `$`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] for an unknown operator.
    pub fn parse(operator: &str) -> OdmResult<Self> {
        let normalized = operator.trim().to_ascii_lowercase();
        let keyword = normalized.strip_prefix('$').unwrap_or(&normalized);

        Ok(match keyword {
            "=" | "==" | "eq" => FieldOp::Eq,
            "!=" | "<>" | "ne" => FieldOp::Ne,
            ">" | "gt" => FieldOp::Gt,
            ">=" | "gte" => FieldOp::Gte,
            "<" | "lt" => FieldOp::Lt,
            "<=" | "lte" => FieldOp::Lte,
            "in" => FieldOp::In,
            "nin" | "not in" => FieldOp::Nin,
            "exists" => FieldOp::Exists,
            "regex" => FieldOp::Regex,
            "like" => FieldOp::Like,
            "ilike" => FieldOp::ILike,
            "all" => FieldOp::All,
            _ => {
                return Err(OdmError::operation(
                    "where",
                    format!("unsupported operator `{operator}`"),
                ));
            }
        })
    }

    /// The store keyword for this operator.
    pub fn keyword(&self) -> &'static str {
        match self {
            FieldOp::Eq => "eq",
            FieldOp::Ne => "ne",
            FieldOp::Gt => "gt",
            FieldOp::Gte => "gte",
            FieldOp::Lt => "lt",
            FieldOp::Lte => "lte",
            FieldOp::In => "in",
            FieldOp::Nin => "nin",
            FieldOp::Exists => "exists",
            FieldOp::Regex => "regex",
            FieldOp::Like => "like",
            FieldOp::ILike => "ilike",
            FieldOp::All => "all",
        }
    }

    /// Rejects operator/value combinations the store would refuse.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] describing the offending combination.
    pub fn check_value(&self, field: &str, value: &Bson) -> OdmResult<()> {
        let fail = |expected: &str| {
            Err(OdmError::operation(
                "where",
                format!(
                    "operator `{}` on `{field}` expects {expected}, got {value}",
                    self.keyword()
                ),
            ))
        };

        match self {
            FieldOp::In | FieldOp::Nin | FieldOp::All => match value {
                Bson::Array(_) => Ok(()),
                _ => fail("an array"),
            },
            FieldOp::Exists => match value {
                Bson::Boolean(_) => Ok(()),
                _ => fail("a boolean"),
            },
            FieldOp::Like | FieldOp::ILike => match value {
                Bson::String(_) => Ok(()),
                _ => fail("a string pattern"),
            },
            FieldOp::Regex => match value {
                Bson::String(pattern) => regex::Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| OdmError::operation("where", format!("invalid regex on `{field}`: {e}"))),
                _ => fail("a string pattern"),
            },
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => match value {
                Bson::Array(_) | Bson::Document(_) => fail("a scalar"),
                _ => Ok(()),
            },
            FieldOp::Eq | FieldOp::Ne => Ok(()),
        }
    }
}

/// Anything accepted as the operator argument of a `where` clause.
pub trait IntoOperator {
    fn into_operator(self) -> OdmResult<FieldOp>;
}

impl IntoOperator for FieldOp {
    fn into_operator(self) -> OdmResult<FieldOp> {
        Ok(self)
    }
}

impl IntoOperator for &str {
    fn into_operator(self) -> OdmResult<FieldOp> {
        FieldOp::parse(self)
    }
}

impl IntoOperator for String {
    fn into_operator(self) -> OdmResult<FieldOp> {
        FieldOp::parse(&self)
    }
}

/// Validates a dotted field path before it reaches the store.
///
/// # Errors
///
/// Returns [`OdmError::Operation`] for empty paths, empty segments, and
/// segments starting with `$`.
pub fn validate_field_path(path: &str) -> OdmResult<()> {
    let fail = |reason: &str| Err(OdmError::operation("where", format!("invalid field path `{path}`: {reason}")));

    if path.is_empty() {
        return fail("path is empty");
    }
    if path.contains('\0') {
        return fail("path contains a NUL byte");
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return fail("path contains an empty segment");
        }
        if segment.starts_with('$') {
            return fail("segments may not start with `$`");
        }
    }

    Ok(())
}

/// Translates a `like` pattern into an anchored regular expression.
///
/// Everything except `%` is matched literally; `%` matches any run of
/// characters.
pub fn like_to_regex(pattern: &str) -> String {
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    format!("^{body}$")
}

/// A filter expression for querying documents.
///
/// # Example
///
/// ```ignore
/// use mondoc::query::Filter;
///
/// let expr = Filter::and(vec![
///     Filter::eq("status", "active"),
///     Filter::gt("age", 18),
/// ]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression.
    Not(Box<Expr>),
    /// Field comparison expression.
    Field {
        /// The field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: impl Into<String>, op: FieldOp, value: impl Into<Bson>) -> Self {
        Expr::Field {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Rewrites every field path with `map`.
    pub fn map_fields(self, map: &dyn Fn(&str) -> String) -> Self {
        match self {
            Expr::And(list) => Expr::And(list.into_iter().map(|e| e.map_fields(map)).collect()),
            Expr::Or(list) => Expr::Or(list.into_iter().map(|e| e.map_fields(map)).collect()),
            Expr::Not(inner) => Expr::Not(Box::new(inner.map_fields(map))),
            Expr::Field { field, op, value } => Expr::Field {
                field: map(&field),
                op,
                value,
            },
        }
    }
}

/// Helper struct for constructing filter expressions.
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Eq, value)
    }

    /// Matches documents where the field does not equal the value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Ne, value)
    }

    /// Matches documents where the field is greater than the value.
    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gt, value)
    }

    /// Matches documents where the field is greater than or equal to the value.
    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gte, value)
    }

    /// Matches documents where the field is less than the value.
    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lt, value)
    }

    /// Matches documents where the field is less than or equal to the value.
    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lte, value)
    }

    /// Matches documents where the field equals one of the values.
    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(field, FieldOp::In, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    /// Matches documents where the field equals none of the values.
    pub fn not_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(field, FieldOp::Nin, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    /// Matches documents where the field is present.
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::field(field, FieldOp::Exists, true)
    }

    /// Matches documents where the field is absent.
    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::field(field, FieldOp::Exists, false)
    }

    /// Matches documents where the string field matches a `%` pattern.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Expr {
        Expr::field(field, FieldOp::Like, pattern.into())
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }
}

/// Field selection applied to returned documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Return only these fields (the primary key is always kept).
    Include(Vec<String>),
    /// Return everything except these fields.
    Exclude(Vec<String>),
}

/// Narrows the elements of an embedded array to those matching `filter`.
///
/// Paths inside `filter` are relative to the array element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementFilter {
    pub field: String,
    pub filter: Expr,
}

/// A structured read request against one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Optional filter expression to match documents.
    pub filter: Option<Expr>,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Optional projection.
    pub projection: Option<Projection>,
    /// Number of documents to skip.
    pub offset: Option<usize>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
    /// Embedded array filters applied to each returned document.
    pub element_filters: Vec<ElementFilter>,
}

impl Query {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(Sort {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter_elements(mut self, field: impl Into<String>, filter: Expr) -> Self {
        self.element_filters.push(ElementFilter {
            field: field.into(),
            filter,
        });
        self
    }
}

/// Aggregation functions available to grouped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
}

impl AccumulatorKind {
    fn prefix(&self) -> &'static str {
        match self {
            AccumulatorKind::Sum => "sum",
            AccumulatorKind::Avg => "avg",
            AccumulatorKind::Min => "min",
            AccumulatorKind::Max => "max",
        }
    }
}

/// One computed column of a grouped query.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub kind: AccumulatorKind,
    pub field: String,
    /// Output key, e.g. `sum_total` for `Sum` over `total`.
    pub alias: String,
}

impl Accumulator {
    pub fn new(kind: AccumulatorKind, field: impl Into<String>) -> Self {
        let field = field.into();
        let alias = format!("{}_{}", kind.prefix(), output_key(&field));

        Self { kind, field, alias }
    }
}

/// Output key for a grouped path: dots become underscores.
pub fn output_key(path: &str) -> String {
    path.replace('.', "_")
}

/// Grouping of matched documents.
///
/// Each output row carries the group keys (see [`output_key`]), a `count`
/// of grouped documents, and one entry per accumulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub keys: Vec<String>,
    pub accumulators: Vec<Accumulator>,
    /// Filter over the output rows.
    pub having: Option<Expr>,
}

/// Addresses one element of an embedded array.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementLocator {
    /// Position in the stored array.
    Index(usize),
    /// Element whose `_id` equals the value.
    Id(Bson),
}

/// One modification of an update request.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Bson),
    Unset(String),
    Push(String, Bson),
    /// Replace one element of an embedded array.
    SetElement {
        field: String,
        locator: ElementLocator,
        value: Bson,
    },
    /// Remove one element of an embedded array.
    PullElement {
        field: String,
        locator: ElementLocator,
    },
}

/// An update request: modifications applied to every matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Set(field.into(), value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset(field.into()));
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Push(field.into(), value.into()));
        self
    }

    pub fn set_element(mut self, field: impl Into<String>, locator: ElementLocator, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::SetElement {
            field: field.into(),
            locator,
            value: value.into(),
        });
        self
    }

    pub fn pull_element(mut self, field: impl Into<String>, locator: ElementLocator) -> Self {
        self.ops.push(UpdateOp::PullElement {
            field: field.into(),
            locator,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Conditions a document must also satisfy for identity-addressed
    /// element replacements to find their element.
    pub fn required_filter(&self) -> Option<Expr> {
        let required = self
            .ops
            .iter()
            .filter_map(|op| match op {
                UpdateOp::SetElement {
                    field,
                    locator: ElementLocator::Id(id),
                    ..
                } => Some(Filter::eq(format!("{field}._id"), id.clone())),
                _ => None,
            })
            .collect::<Vec<_>>();

        match required.len() {
            0 => None,
            1 => required.into_iter().next(),
            _ => Some(Expr::And(required)),
        }
    }
}

/// Result of an update request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter.
    pub matched: u64,
    /// Documents actually changed.
    pub modified: u64,
}

/// Visitor over [`Expr`] trees, implemented by compilers and evaluators.
pub trait QueryVisitor {
    type Output;
    type Error: Into<OdmError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_operator_alphabets_resolve_to_the_same_operator() {
        let pairs = [
            ("=", "eq"),
            ("==", "$eq"),
            ("!=", "ne"),
            ("<>", "NE"),
            (">", "gt"),
            (">=", "gte"),
            ("<", "lt"),
            ("<=", "$lte"),
        ];

        for (symbol, keyword) in pairs {
            assert_eq!(FieldOp::parse(symbol).unwrap(), FieldOp::parse(keyword).unwrap(), "{symbol} vs {keyword}");
        }

        assert_eq!(FieldOp::parse("in").unwrap(), FieldOp::In);
        assert_eq!(FieldOp::parse("nin").unwrap(), FieldOp::Nin);
        assert_eq!(FieldOp::parse("exists").unwrap(), FieldOp::Exists);
        assert_eq!(FieldOp::parse("regex").unwrap(), FieldOp::Regex);
        assert!(FieldOp::parse("~=").is_err());
    }

    #[test]
    fn unsupported_value_combinations_fail_fast() {
        assert!(FieldOp::In.check_value("tags", &Bson::String("a".into())).is_err());
        assert!(FieldOp::Exists.check_value("tags", &Bson::Int32(1)).is_err());
        assert!(FieldOp::Like.check_value("name", &Bson::Int32(1)).is_err());
        assert!(FieldOp::Regex.check_value("name", &Bson::String("(".into())).is_err());
        assert!(FieldOp::Gt.check_value("age", &Bson::Array(vec![])).is_err());
        assert!(FieldOp::Gt.check_value("age", &Bson::Int32(3)).is_ok());
    }

    #[test]
    fn field_paths_are_validated() {
        assert!(validate_field_path("address.city").is_ok());
        assert!(validate_field_path("").is_err());
        assert!(validate_field_path("address..city").is_err());
        assert!(validate_field_path("$where").is_err());
    }

    #[test]
    fn like_patterns_escape_everything_but_percent() {
        assert_eq!(like_to_regex("J%n"), "^J.*n$");
        assert_eq!(like_to_regex("a.b%"), "^a\\.b.*$");
        assert_eq!(like_to_regex("100%_off"), "^100.*_off$");
    }

    #[test]
    fn identity_element_updates_require_the_element() {
        let update = Update::new().set_element("items", ElementLocator::Id(Bson::Int32(7)), Bson::Null);

        assert_eq!(update.required_filter(), Some(Filter::eq("items._id", 7)));
        assert_eq!(Update::new().set("a", 1).required_filter(), None);
    }
}
