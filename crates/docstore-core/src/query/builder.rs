//! Fluent construction of [`RelationalQuery`] values.

use super::{
    AggregateFunction, Aggregation, Filter, FilterCondition, FilterOperator, Join, JoinOn,
    JoinType, LogicalOperator, RelationalQuery, SortDirection, SortSpec, StorageQuery, TimeRange,
};
use crate::error::{Error, Result};
use serde_json::Value;

/// Accumulates a [`RelationalQuery`].
///
/// ```
/// use docstore_core::query::{FilterOperator, QueryBuilder};
/// use serde_json::json;
///
/// let query = QueryBuilder::new()
///     .from("users")
///     .where_eq("status", json!("active"))
///     .where_op("age", FilterOperator::Gte, json!(18))
///     .order_by("name", docstore_core::query::SortDirection::Asc)
///     .paginate(2, 20)
///     .build()
///     .unwrap();
/// assert_eq!(query.offset, Some(20));
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: RelationalQuery,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary collection.
    pub fn from(mut self, collection: impl Into<String>) -> Self {
        self.query.collection = collection.into();
        self
    }

    /// `AND` an equality condition.
    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.where_op(field, FilterOperator::Eq, value)
    }

    /// `AND` a condition with an explicit operator.
    pub fn where_op(self, field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        self.where_filter(FilterCondition::new(field, operator, value))
    }

    /// `AND` a condition or a whole filter tree.
    pub fn where_filter(mut self, filter: impl Into<Filter>) -> Self {
        self.push(filter.into(), LogicalOperator::And);
        self
    }

    /// `OR` a condition or filter tree with everything so far.
    pub fn or(mut self, filter: impl Into<Filter>) -> Self {
        self.push(filter.into(), LogicalOperator::Or);
        self
    }

    fn push(&mut self, filter: Filter, op: LogicalOperator) {
        let existing = self.query.filter.take();
        self.query.filter = Some(Filter::combine(existing, filter, op));
    }

    /// Join another collection on `local == foreign`.
    pub fn join(
        mut self,
        join_type: JoinType,
        collection: impl Into<String>,
        local: impl Into<String>,
        foreign: impl Into<String>,
    ) -> Self {
        self.query.joins.push(Join {
            join_type,
            collection: collection.into(),
            on: JoinOn {
                local: local.into(),
                foreign: foreign.into(),
            },
            alias: None,
        });
        self
    }

    pub fn inner_join(
        self,
        collection: impl Into<String>,
        local: impl Into<String>,
        foreign: impl Into<String>,
    ) -> Self {
        self.join(JoinType::Inner, collection, local, foreign)
    }

    pub fn left_join(
        self,
        collection: impl Into<String>,
        local: impl Into<String>,
        foreign: impl Into<String>,
    ) -> Self {
        self.join(JoinType::Left, collection, local, foreign)
    }

    /// Rename the most recent join's output key.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        if let Some(join) = self.query.joins.last_mut() {
            join.alias = Some(alias.into());
        }
        self
    }

    /// Keep only these payload fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query
            .select
            .get_or_insert_with(Vec::new)
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Drop these payload fields.
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query
            .exclude
            .get_or_insert_with(Vec::new)
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    /// Replace all sort keys.
    pub fn sort(mut self, sort: Vec<SortSpec>) -> Self {
        self.query.sort = sort;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// 1-based page of `page_size` records.
    pub fn paginate(mut self, page: usize, page_size: usize) -> Self {
        self.query.limit = Some(page_size);
        self.query.offset = Some(page.saturating_sub(1) * page_size);
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.group_by.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        field: Option<&str>,
        alias: impl Into<String>,
    ) -> Self {
        self.query.aggregations.push(Aggregation {
            function,
            field: field.map(str::to_string),
            alias: alias.into(),
        });
        self
    }

    /// Row count, exposed as `alias`.
    pub fn count(self, alias: impl Into<String>) -> Self {
        self.aggregate(AggregateFunction::Count, None, alias)
    }

    /// `AND` a case-insensitive substring match on any of `fields`.
    pub fn search<I, S>(self, term: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conditions: Vec<Filter> = fields
            .into_iter()
            .map(|f| {
                FilterCondition::new(f, FilterOperator::Contains, Value::String(term.to_string()))
                    .into()
            })
            .collect();
        if conditions.is_empty() {
            return self;
        }
        self.where_filter(Filter::or(conditions))
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.query.time_range = Some(range);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn explain(mut self) -> Self {
        self.query.explain = true;
        self
    }

    /// Finish, failing when no collection was set.
    pub fn build(self) -> Result<RelationalQuery> {
        if self.query.collection.is_empty() {
            return Err(Error::Validation(
                "query builder requires a collection; call from() first".into(),
            ));
        }
        Ok(self.query)
    }

    /// Finish in the simple single-map form for backends without trees.
    pub fn to_legacy(self) -> Result<StorageQuery> {
        Ok(self.build()?.to_legacy())
    }
}
