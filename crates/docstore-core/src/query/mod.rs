//! Query model shared by every backend.
//!
//! [`StorageQuery`] is the simple form (equality map plus optional inline
//! `$gt`-style operators). [`RelationalQuery`] adds a filter tree, joins,
//! projection, grouping and aggregation. Both are plain JSON-serializable
//! values; backends either evaluate them in memory ([`eval`]) or compile
//! them to SQL.

pub mod builder;
pub mod eval;

use crate::error::{Error, Result};
use crate::record::DataRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use builder::QueryBuilder;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc }
    }
}

/// Inclusive bounds on `metadata.createdAt`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}

/// The simple query form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuery {
    pub collection: String,
    /// Field → value, or field → `{"$gt": ..}` style operator object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl StorageQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter
            .get_or_insert_with(Map::new)
            .insert(field.into(), value);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.get_or_insert_with(Vec::new).push(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Comparison applied by a [`FilterCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive substring match (`LIKE '%..%'`)
    Contains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    /// Map an inline `$op` key to an operator.
    pub fn from_inline(key: &str) -> Option<Self> {
        Some(match key {
            "$eq" => FilterOperator::Eq,
            "$ne" => FilterOperator::Ne,
            "$gt" => FilterOperator::Gt,
            "$gte" => FilterOperator::Gte,
            "$lt" => FilterOperator::Lt,
            "$lte" => FilterOperator::Lte,
            "$in" => FilterOperator::In,
            "$nin" => FilterOperator::NotIn,
            "$contains" => FilterOperator::Contains,
            _ => return None,
        })
    }

    /// Whether the operator ignores its value.
    pub fn is_unary(self) -> bool {
        matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }
}

/// Boolean combinator of a [`FilterGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Leaf of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
    /// Joined collection (or alias) the field belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            collection: None,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    pub fn on_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// Interior node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub operator: LogicalOperator,
    pub conditions: Vec<Filter>,
}

/// A filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Group(FilterGroup),
    Condition(FilterCondition),
}

impl From<FilterCondition> for Filter {
    fn from(c: FilterCondition) -> Self {
        Filter::Condition(c)
    }
}

impl From<FilterGroup> for Filter {
    fn from(g: FilterGroup) -> Self {
        Filter::Group(g)
    }
}

impl Filter {
    pub fn and(conditions: Vec<Filter>) -> Self {
        Filter::Group(FilterGroup { operator: LogicalOperator::And, conditions })
    }

    pub fn or(conditions: Vec<Filter>) -> Self {
        Filter::Group(FilterGroup { operator: LogicalOperator::Or, conditions })
    }

    /// Fold `next` into `existing` under `op`.
    ///
    /// A root group that already uses `op` is extended in place; any other
    /// root is wrapped in a new group.
    pub fn combine(existing: Option<Filter>, next: Filter, op: LogicalOperator) -> Filter {
        match existing {
            None => next,
            Some(Filter::Group(mut group)) if group.operator == op => {
                match next {
                    Filter::Group(inner) if inner.operator == op => {
                        group.conditions.extend(inner.conditions)
                    }
                    other => group.conditions.push(other),
                }
                Filter::Group(group)
            }
            Some(root) => Filter::Group(FilterGroup {
                operator: op,
                conditions: vec![root, next],
            }),
        }
    }

    /// Convert the legacy equality map into a filter tree.
    ///
    /// Values that are objects made only of recognised `$op` keys expand
    /// into one condition per operator; everything else is equality.
    pub fn from_legacy(map: &Map<String, Value>) -> Option<Filter> {
        let mut conditions = Vec::new();
        for (field, value) in map {
            match inline_operators(value) {
                Some(ops) => {
                    for (op, operand) in ops {
                        conditions.push(Filter::Condition(FilterCondition::new(
                            field.clone(),
                            op,
                            operand.clone(),
                        )));
                    }
                }
                None => conditions.push(Filter::Condition(FilterCondition::eq(
                    field.clone(),
                    value.clone(),
                ))),
            }
        }
        match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(Filter::and(conditions)),
        }
    }

    /// Visit every leaf condition.
    pub fn conditions(&self) -> Vec<&FilterCondition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a FilterCondition>) {
        match self {
            Filter::Condition(c) => out.push(c),
            Filter::Group(g) => g.conditions.iter().for_each(|f| f.collect_conditions(out)),
        }
    }
}

fn inline_operators(value: &Value) -> Option<Vec<(FilterOperator, &Value)>> {
    let obj = value.as_object()?;
    if obj.is_empty() {
        return None;
    }
    obj.iter()
        .map(|(k, v)| FilterOperator::from_inline(k).map(|op| (op, v)))
        .collect()
}

/// Join kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
}

/// Join key pair: a field of the primary collection and one of the joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOn {
    pub local: String,
    pub foreign: String,
}

/// A join against another collection.
///
/// The joined record's payload is exposed in each result under `alias`
/// (defaulting to the collection name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    #[serde(rename = "type")]
    pub join_type: JoinType,
    pub collection: String,
    pub on: JoinOn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Join {
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.collection)
    }
}

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_sql(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// One aggregate column of a grouped query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// `None` only makes sense for `count`, meaning "count rows"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub alias: String,
}

/// The full query form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationalQuery {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub explain: bool,
}

impl RelationalQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Whether the query produces grouped rows rather than records.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregations.is_empty()
    }

    /// Downgrade to the simple form.
    ///
    /// Only equality conditions combined with `and` survive; joins,
    /// projection and aggregation are dropped.
    pub fn to_legacy(&self) -> StorageQuery {
        let mut filter = Map::new();
        if let Some(root) = &self.filter {
            collect_legacy_equalities(root, &mut filter);
        }
        StorageQuery {
            collection: self.collection.clone(),
            filter: if filter.is_empty() { None } else { Some(filter) },
            sort: if self.sort.is_empty() { None } else { Some(self.sort.clone()) },
            limit: self.limit,
            offset: self.offset,
            time_range: self.time_range.clone(),
            tags: self.tags.clone(),
        }
    }

    /// Check every identifier the query carries before execution.
    pub fn validate(&self) -> Result<()> {
        crate::record::validate_collection_name(&self.collection)?;
        for join in &self.joins {
            crate::record::validate_collection_name(&join.collection)?;
            validate_identifier(join.alias())?;
            validate_field_path(&join.on.local)?;
            validate_field_path(&join.on.foreign)?;
        }
        if let Some(filter) = &self.filter {
            for c in filter.conditions() {
                validate_field_path(&c.field)?;
                if let Some(scope) = &c.collection {
                    let known = scope == &self.collection
                        || self
                            .joins
                            .iter()
                            .any(|j| j.alias() == scope.as_str() || j.collection == *scope);
                    if !known {
                        return Err(Error::Query(format!(
                            "condition on '{}' references unknown collection '{}'",
                            c.field, scope
                        )));
                    }
                }
                if matches!(c.operator, FilterOperator::In | FilterOperator::NotIn) && !c.value.is_array() {
                    return Err(Error::Query(format!(
                        "operator on '{}' requires an array value",
                        c.field
                    )));
                }
            }
        }
        for field in self.select.iter().flatten().chain(self.exclude.iter().flatten()) {
            validate_field_path(field)?;
        }
        for field in &self.group_by {
            validate_field_path(field)?;
        }
        for agg in &self.aggregations {
            validate_identifier(&agg.alias)?;
            match &agg.field {
                Some(field) => validate_field_path(field)?,
                None if agg.function != AggregateFunction::Count => {
                    return Err(Error::Query(format!(
                        "aggregation '{}' needs a field",
                        agg.alias
                    )))
                }
                None => {}
            }
        }
        for sort in &self.sort {
            validate_field_path(&sort.field)?;
            if self.is_aggregate()
                && !self.group_by.contains(&sort.field)
                && !self.aggregations.iter().any(|a| a.alias == sort.field)
            {
                return Err(Error::Query(format!(
                    "grouped query can only sort on group keys or aggregate aliases, got '{}'",
                    sort.field
                )));
            }
        }
        Ok(())
    }
}

fn collect_legacy_equalities(filter: &Filter, out: &mut Map<String, Value>) {
    match filter {
        Filter::Condition(c) if c.operator == FilterOperator::Eq && c.collection.is_none() => {
            out.insert(c.field.clone(), c.value.clone());
        }
        Filter::Group(g) if g.operator == LogicalOperator::And => {
            g.conditions.iter().for_each(|f| collect_legacy_equalities(f, out))
        }
        _ => {}
    }
}

impl From<StorageQuery> for RelationalQuery {
    fn from(q: StorageQuery) -> Self {
        RelationalQuery {
            filter: q.filter.as_ref().and_then(Filter::from_legacy),
            collection: q.collection,
            sort: q.sort.unwrap_or_default(),
            limit: q.limit,
            offset: q.offset,
            time_range: q.time_range,
            tags: q.tags,
            ..Default::default()
        }
    }
}

/// Record-level field a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Id,
    CreatedAt,
    UpdatedAt,
    Version,
    /// Path inside the payload
    Data(&'a str),
}

/// Resolve a query field name.
///
/// `id` and `metadata.{createdAt,updatedAt,version}` address bookkeeping;
/// `data.x` and bare `x` address the payload.
pub fn resolve_field(field: &str) -> FieldRef<'_> {
    match field {
        "id" => FieldRef::Id,
        "metadata.createdAt" => FieldRef::CreatedAt,
        "metadata.updatedAt" => FieldRef::UpdatedAt,
        "metadata.version" => FieldRef::Version,
        other => FieldRef::Data(other.strip_prefix("data.").unwrap_or(other)),
    }
}

/// Restrict a field path to `[A-Za-z0-9_.\[\]]`.
///
/// Paths are interpolated into JSON-path expressions, so nothing outside
/// this class may pass.
pub fn validate_field_path(path: &str) -> Result<()> {
    let ok = !path.is_empty()
        && path.len() <= 256
        && !path.starts_with(['.', '['])
        && !path.ends_with('.')
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']'));
    if ok {
        Ok(())
    } else {
        Err(Error::Query(format!("invalid field path '{}'", path)))
    }
}

/// Restrict an output identifier (alias) to `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let ok = chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 64;
    if ok {
        Ok(())
    } else {
        Err(Error::Query(format!("invalid identifier '{}'", name)))
    }
}

/// Output of a relational query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    /// Matching records; joined payloads appear under each join alias
    pub records: Vec<DataRecord>,
    /// One row per group for aggregate queries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<QueryExplanation>,
}

/// Dry-run diagnostics for a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExplanation {
    pub backend: String,
    /// SQL text, or a description of the in-memory plan
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<usize>,
}
