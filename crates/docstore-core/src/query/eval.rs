//! In-memory query evaluation.
//!
//! The memory and file backends run every query through [`execute`]; the
//! SQLite backend compiles the same tree to SQL. Operator semantics here are
//! the reference the SQL compiler mirrors.

use super::{
    resolve_field, AggregateFunction, Aggregation, FieldRef, Filter, FilterCondition,
    FilterOperator, JoinType, LogicalOperator, QueryOutput, RelationalQuery, SortDirection,
    SortSpec,
};
use crate::error::Result;
use crate::record::{timestamp_string, DataRecord};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Resolve `field` against a record.
pub fn lookup(record: &DataRecord, field: &str) -> Option<Value> {
    match resolve_field(field) {
        FieldRef::Id => Some(Value::String(record.id.clone())),
        FieldRef::CreatedAt => Some(Value::String(timestamp_string(&record.metadata.created_at))),
        FieldRef::UpdatedAt => Some(Value::String(timestamp_string(&record.metadata.updated_at))),
        FieldRef::Version => Some(Value::from(record.metadata.version)),
        FieldRef::Data(path) => get_path(&record.data, path).cloned(),
    }
}

/// Walk a dotted/bracketed path such as `a.b[0].c`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        for index in indexes.split('[').filter(|s| !s.is_empty()) {
            let i: usize = index.trim_end_matches(']').parse().ok()?;
            current = current.as_array()?.get(i)?;
        }
    }
    Some(current)
}

/// Equality with numeric normalisation (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn number_cmp(x: &Number, y: &Number) -> Option<Ordering> {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

/// Ordering between comparable scalars; `None` across types.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Array(_)) => 3,
        Some(Value::Object(_)) => 4,
    }
}

/// Total order used for sorting: missing/null first, then numbers, then text.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let as_num = |v: Option<&Value>| match v {
        Some(Value::Bool(flag)) => Some(Value::from(*flag as i64)),
        other => other.cloned(),
    };
    let (a, b) = (as_num(a), as_num(b));
    type_rank(a.as_ref())
        .cmp(&type_rank(b.as_ref()))
        .then_with(|| match (&a, &b) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        })
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Evaluate one condition against a field value (`None` = field missing).
pub fn condition_holds(condition: &FilterCondition, actual: Option<&Value>) -> bool {
    let present = actual.filter(|v| !v.is_null());
    let expected = &condition.value;
    match condition.operator {
        FilterOperator::Eq if expected.is_null() => present.is_none(),
        FilterOperator::Ne if expected.is_null() => present.is_some(),
        FilterOperator::Eq => present.map_or(false, |v| values_equal(v, expected)),
        FilterOperator::Ne => present.map_or(true, |v| !values_equal(v, expected)),
        FilterOperator::Gt => ordered(present, expected, |o| o == Ordering::Greater),
        FilterOperator::Gte => ordered(present, expected, |o| o != Ordering::Less),
        FilterOperator::Lt => ordered(present, expected, |o| o == Ordering::Less),
        FilterOperator::Lte => ordered(present, expected, |o| o != Ordering::Greater),
        FilterOperator::Contains => match (present.and_then(text_of), text_of(expected)) {
            (Some(haystack), Some(needle)) => haystack
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            _ => false,
        },
        FilterOperator::In => match (present, expected.as_array()) {
            (Some(v), Some(options)) => options.iter().any(|o| values_equal(v, o)),
            _ => false,
        },
        FilterOperator::NotIn => match (present, expected.as_array()) {
            (Some(v), Some(options)) => !options.iter().any(|o| values_equal(v, o)),
            (None, _) => true,
            (Some(_), None) => false,
        },
        FilterOperator::IsNull => present.is_none(),
        FilterOperator::IsNotNull => present.is_some(),
    }
}

fn ordered(actual: Option<&Value>, expected: &Value, test: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|v| compare(v, expected))
        .map_or(false, test)
}

/// Evaluate a filter tree against a record.
///
/// Conditions scoped to a joined collection read the joined payload stored
/// under that alias; `scopes` maps collection names and aliases to aliases.
pub fn matches(filter: &Filter, record: &DataRecord, scopes: &HashMap<String, String>) -> bool {
    match filter {
        Filter::Condition(c) => {
            let actual = match c.collection.as_deref().and_then(|s| scopes.get(s)) {
                Some(alias) => record
                    .data
                    .get(alias)
                    .and_then(|joined| get_path(joined, strip_data_prefix(&c.field)))
                    .cloned(),
                None => lookup(record, &c.field),
            };
            condition_holds(c, actual.as_ref())
        }
        Filter::Group(g) => match g.operator {
            LogicalOperator::And => g.conditions.iter().all(|f| matches(f, record, scopes)),
            LogicalOperator::Or => g.conditions.iter().any(|f| matches(f, record, scopes)),
        },
    }
}

fn strip_data_prefix(field: &str) -> &str {
    field.strip_prefix("data.").unwrap_or(field)
}

/// Order records by `sort`, falling back to creation time then id.
pub fn sort_records(records: &mut [DataRecord], sort: &[SortSpec]) {
    records.sort_by(|a, b| {
        for spec in sort {
            let ord = sort_order(lookup(a, &spec.field).as_ref(), lookup(b, &spec.field).as_ref());
            let ord = match spec.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.metadata
            .created_at
            .cmp(&b.metadata.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Apply `offset` then `limit`.
pub fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Top-level payload key a projection path refers to.
fn projection_key(path: &str) -> &str {
    let path = strip_data_prefix(path);
    let end = path.find(['.', '[']).unwrap_or(path.len());
    &path[..end]
}

/// Apply `select`/`exclude` to a payload.
pub fn project(data: &mut Value, select: Option<&[String]>, exclude: Option<&[String]>) {
    let Some(obj) = data.as_object_mut() else {
        return;
    };
    if let Some(fields) = select {
        let keep: Vec<&str> = fields.iter().map(|f| projection_key(f)).collect();
        obj.retain(|k, _| keep.contains(&k.as_str()));
    }
    if let Some(fields) = exclude {
        for f in fields {
            obj.remove(projection_key(f));
        }
    }
}

/// Run a full relational query over pre-loaded records.
///
/// `joined` holds the records of every joined collection, keyed by
/// collection name.
pub fn execute(
    query: &RelationalQuery,
    primary: Vec<DataRecord>,
    joined: &HashMap<String, Vec<DataRecord>>,
) -> Result<QueryOutput> {
    query.validate()?;

    let mut rows: Vec<DataRecord> = primary
        .into_iter()
        .filter(|r| r.collection == query.collection)
        .filter(|r| {
            query
                .time_range
                .as_ref()
                .map_or(true, |range| range.contains(r.metadata.created_at))
        })
        .filter(|r| query.tags.as_ref().map_or(true, |tags| r.metadata.has_tags(tags)))
        .collect();

    let mut scopes = HashMap::new();
    for join in &query.joins {
        scopes.insert(join.collection.clone(), join.alias().to_string());
        scopes.insert(join.alias().to_string(), join.alias().to_string());
        let empty = Vec::new();
        let candidates = joined.get(&join.collection).unwrap_or(&empty);
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            let local = lookup(&row, &join.on.local).filter(|v| !v.is_null());
            let hits: Vec<&DataRecord> = match &local {
                Some(key) => candidates
                    .iter()
                    .filter(|c| {
                        lookup(c, &join.on.foreign).map_or(false, |f| values_equal(&f, key))
                    })
                    .collect(),
                None => Vec::new(),
            };
            if hits.is_empty() {
                if join.join_type == JoinType::Left {
                    next.push(attach(row, join.alias(), Value::Null));
                }
                continue;
            }
            for hit in hits {
                next.push(attach(row.clone(), join.alias(), hit.data.clone()));
            }
        }
        rows = next;
    }

    if let Some(filter) = &query.filter {
        rows.retain(|r| matches(filter, r, &scopes));
    }

    if query.is_aggregate() {
        let mut groups = group_rows(&rows, &query.group_by, &query.aggregations);
        sort_groups(&mut groups, &query.sort, &query.group_by);
        return Ok(QueryOutput {
            records: Vec::new(),
            groups: paginate(groups, query.offset, query.limit),
            explanation: None,
        });
    }

    sort_records(&mut rows, &query.sort);
    let mut records = paginate(rows, query.offset, query.limit);
    if query.select.is_some() || query.exclude.is_some() {
        for r in &mut records {
            project(&mut r.data, query.select.as_deref(), query.exclude.as_deref());
        }
    }
    Ok(QueryOutput {
        records,
        groups: Vec::new(),
        explanation: None,
    })
}

fn attach(mut record: DataRecord, alias: &str, joined: Value) -> DataRecord {
    if let Value::Object(obj) = &mut record.data {
        obj.insert(alias.to_string(), joined);
    }
    record
}

fn group_rows(
    rows: &[DataRecord],
    group_by: &[String],
    aggregations: &[Aggregation],
) -> Vec<Map<String, Value>> {
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut members: HashMap<String, Vec<&DataRecord>> = HashMap::new();
    for row in rows {
        let key: Vec<Value> = group_by
            .iter()
            .map(|f| lookup(row, f).unwrap_or(Value::Null))
            .collect();
        let token = Value::Array(key.clone()).to_string();
        members
            .entry(token)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }
    // An ungrouped aggregate over zero rows still yields one row.
    if group_by.is_empty() && order.is_empty() {
        order.push(Vec::new());
        members.insert(Value::Array(Vec::new()).to_string(), Vec::new());
    }

    order
        .into_iter()
        .map(|key| {
            let token = Value::Array(key.clone()).to_string();
            let rows = members.get(&token).map(Vec::as_slice).unwrap_or_default();
            let mut out = Map::new();
            for (field, value) in group_by.iter().zip(key) {
                out.insert(field.clone(), value);
            }
            for agg in aggregations {
                out.insert(agg.alias.clone(), aggregate(agg, rows));
            }
            out
        })
        .collect()
}

fn aggregate(agg: &Aggregation, rows: &[&DataRecord]) -> Value {
    let values: Vec<Value> = match &agg.field {
        Some(field) => rows
            .iter()
            .filter_map(|r| lookup(r, field))
            .filter(|v| !v.is_null())
            .collect(),
        None => return Value::from(rows.len()),
    };
    match agg.function {
        AggregateFunction::Count => Value::from(values.len()),
        AggregateFunction::Sum | AggregateFunction::Avg => {
            let numbers: Vec<&Number> = values.iter().filter_map(Value::as_number).collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            let all_ints = numbers.iter().all(|n| n.as_i64().is_some());
            let total: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
            if agg.function == AggregateFunction::Avg {
                Value::from(total / numbers.len() as f64)
            } else if all_ints {
                Value::from(numbers.iter().filter_map(|n| n.as_i64()).sum::<i64>())
            } else {
                Value::from(total)
            }
        }
        AggregateFunction::Min => extreme(values, Ordering::Less),
        AggregateFunction::Max => extreme(values, Ordering::Greater),
    }
}

fn extreme(values: Vec<Value>, wanted: Ordering) -> Value {
    values
        .into_iter()
        .reduce(|best, v| {
            if sort_order(Some(&v), Some(&best)) == wanted {
                v
            } else {
                best
            }
        })
        .unwrap_or(Value::Null)
}

fn sort_groups(groups: &mut [Map<String, Value>], sort: &[SortSpec], group_by: &[String]) {
    let default_keys: Vec<SortSpec> = group_by.iter().map(SortSpec::asc).collect();
    let keys = if sort.is_empty() { &default_keys } else { sort };
    groups.sort_by(|a, b| {
        for spec in keys {
            let ord = sort_order(a.get(&spec.field), b.get(&spec.field));
            let ord = match spec.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterCondition, QueryBuilder};
    use serde_json::json;

    fn users() -> Vec<DataRecord> {
        vec![
            DataRecord::new("users", "u1", json!({"name": "Ada", "age": 36, "team": "core"})),
            DataRecord::new("users", "u2", json!({"name": "Grace", "age": 45, "team": "core"})),
            DataRecord::new("users", "u3", json!({"name": "Linus", "age": 28, "team": "kernel"})),
            DataRecord::new("users", "u4", json!({"name": "Barbara", "team": "kernel"})),
        ]
    }

    fn run(query: RelationalQuery) -> QueryOutput {
        execute(&query, users(), &HashMap::new()).unwrap()
    }

    fn ids(out: &QueryOutput) -> Vec<&str> {
        out.records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_get_path_with_indexes() {
        let v = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(get_path(&v, "a.b[1].c"), Some(&json!(2)));
        assert_eq!(get_path(&v, "a.x"), None);
    }

    #[test]
    fn test_range_and_membership_operators() {
        let q = QueryBuilder::new()
            .from("users")
            .where_op("age", FilterOperator::Gte, json!(30))
            .build()
            .unwrap();
        let mut got = ids(&run(q)).into_iter().map(String::from).collect::<Vec<_>>();
        got.sort();
        assert_eq!(got, vec!["u1", "u2"]);

        let q = QueryBuilder::new()
            .from("users")
            .where_op("name", FilterOperator::In, json!(["Ada", "Linus"]))
            .build()
            .unwrap();
        assert_eq!(run(q).records.len(), 2);

        // Missing fields satisfy $ne and $nin but never ordered comparisons.
        let q = QueryBuilder::new()
            .from("users")
            .where_op("age", FilterOperator::Ne, json!(36))
            .build()
            .unwrap();
        assert_eq!(run(q).records.len(), 3);
        let q = QueryBuilder::new()
            .from("users")
            .where_op("age", FilterOperator::Lt, json!(100))
            .build()
            .unwrap();
        assert_eq!(run(q).records.len(), 3);
    }

    #[test]
    fn test_contains_is_case_insensitive() {
        let q = QueryBuilder::new()
            .from("users")
            .search("AR", ["name"])
            .build()
            .unwrap();
        let out = run(q);
        assert_eq!(ids(&out), vec!["u4"]);
    }

    #[test]
    fn test_is_null_matches_missing() {
        let q = QueryBuilder::new()
            .from("users")
            .where_op("age", FilterOperator::IsNull, Value::Null)
            .build()
            .unwrap();
        assert_eq!(ids(&run(q)), vec!["u4"]);
    }

    #[test]
    fn test_sort_and_paginate() {
        let q = QueryBuilder::new()
            .from("users")
            .order_by("age", SortDirection::Desc)
            .limit(2)
            .offset(1)
            .build()
            .unwrap();
        assert_eq!(ids(&run(q)), vec!["u1", "u3"]);
    }

    #[test]
    fn test_projection() {
        let q = QueryBuilder::new()
            .from("users")
            .where_eq("id", json!("u1"))
            .select(["name"])
            .build()
            .unwrap();
        assert_eq!(run(q).records[0].data, json!({"name": "Ada"}));

        let q = QueryBuilder::new()
            .from("users")
            .where_eq("id", json!("u1"))
            .exclude(["age", "team"])
            .build()
            .unwrap();
        assert_eq!(run(q).records[0].data, json!({"name": "Ada"}));
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let q = QueryBuilder::new()
            .from("users")
            .group_by(["team"])
            .count("n")
            .aggregate(AggregateFunction::Sum, Some("age"), "total_age")
            .aggregate(AggregateFunction::Max, Some("age"), "oldest")
            .build()
            .unwrap();
        let out = run(q);
        assert!(out.records.is_empty());
        assert_eq!(out.groups.len(), 2);
        assert_eq!(out.groups[0]["team"], json!("core"));
        assert_eq!(out.groups[0]["n"], json!(2));
        assert_eq!(out.groups[0]["total_age"], json!(81));
        assert_eq!(out.groups[1]["oldest"], json!(28));
    }

    #[test]
    fn test_inner_and_left_join() {
        let orders = vec![
            DataRecord::new("orders", "o1", json!({"userId": "u1", "total": 10})),
            DataRecord::new("orders", "o2", json!({"userId": "u9", "total": 5})),
        ];
        let mut joined = HashMap::new();
        joined.insert("users".to_string(), users());

        let inner = QueryBuilder::new()
            .from("orders")
            .inner_join("users", "userId", "id")
            .build()
            .unwrap();
        let out = execute(&inner, orders.clone(), &joined).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].data["users"]["name"], json!("Ada"));

        let left = QueryBuilder::new()
            .from("orders")
            .left_join("users", "userId", "id")
            .alias("customer")
            .where_filter(FilterCondition::eq("name", json!("Ada")).on_collection("customer"))
            .or(FilterCondition::eq("total", json!(5)))
            .build()
            .unwrap();
        let out = execute(&left, orders, &joined).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[1].data["customer"], Value::Null);
    }
}
