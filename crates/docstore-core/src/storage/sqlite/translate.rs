//! Compile a [`RelationalQuery`] into parameterized SQL over `_data`.
//!
//! Values are always bound. The only text interpolated into the statement
//! is field paths (checked by [`validate_field_path`]), extraction column
//! names derived from registered fields, and table names derived from
//! validated collection names.

use crate::error::{Error, Result};
use crate::query::{
    resolve_field, validate_field_path, AggregateFunction, FieldRef, Filter, FilterCondition,
    FilterOperator, JoinType, LogicalOperator, RelationalQuery, SortDirection,
};
use crate::record::timestamp_string;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Columns every record query selects, in order.
pub const RECORD_COLUMNS: &str =
    "d.id, d.collection, d.data, d.created_at, d.updated_at, d.version, d.tags, d.ttl";

/// How to decode one output column of a grouped query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupColumn {
    pub name: String,
    /// Column holds JSON text (from the `->` operator) rather than a scalar
    pub json: bool,
}

/// Shape of the rows a compiled statement yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowShape {
    /// [`RECORD_COLUMNS`] followed by one payload column per join alias
    Records { join_aliases: Vec<String> },
    Groups { columns: Vec<GroupColumn> },
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub shape: RowShape,
}

impl CompiledQuery {
    pub fn sql_params(&self) -> Vec<SqlValue> {
        self.params.iter().map(to_sql_value).collect()
    }
}

/// Bind form of a JSON value.
///
/// Booleans bind as 0/1 (what `JSON_EXTRACT` yields for them); arrays and
/// objects bind as their compact JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Decode a scalar column back into JSON.
pub fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::from(b),
    }
}

/// Name of the side table holding extracted columns for `collection`.
pub fn extract_table(collection: &str) -> String {
    format!("\"_extract_{}\"", collection)
}

/// Column name for an extracted field path: `a.b[0]` → `f_a_b_0_`.
pub fn extract_column(field: &str) -> String {
    let body: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("f_{}", body)
}

/// What SQL type family an expression produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Integer,
    /// JSON payload value; check `JSON_TYPE` before typed comparisons
    Json,
}

/// A resolved field.
struct Target {
    expr: String,
    kind: Kind,
    /// `(table.data, '$.path')` arguments for `JSON_TYPE`, when `kind == Json`
    json_args: Option<String>,
}

fn json_path(path: &str) -> String {
    format!("'$.{}'", path)
}

fn quote_list(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Compiles one query; holds the parameter list as it grows.
pub struct Translator<'a> {
    query: &'a RelationalQuery,
    extracted: &'a [String],
    params: Vec<Value>,
}

impl<'a> Translator<'a> {
    /// `extracted` lists the registered extraction fields of the primary
    /// collection; an empty slice means every field goes through JSON.
    pub fn new(query: &'a RelationalQuery, extracted: &'a [String]) -> Self {
        Self {
            query,
            extracted,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn join_index(&self, scope: &str) -> Option<usize> {
        self.query
            .joins
            .iter()
            .position(|j| j.alias() == scope)
            .or_else(|| self.query.joins.iter().position(|j| j.collection == scope))
    }

    fn uses_extraction(&self) -> bool {
        !self.extracted.is_empty()
    }

    fn json_target(table: &str, path: &str) -> Target {
        let args = format!("{}.data, {}", table, json_path(path));
        Target {
            expr: format!("JSON_EXTRACT({})", args),
            kind: Kind::Json,
            json_args: Some(args),
        }
    }

    /// Resolve a field of the primary collection.
    fn primary_target(&self, field: &str) -> Target {
        match resolve_field(field) {
            FieldRef::Id => Target { expr: "d.id".into(), kind: Kind::Text, json_args: None },
            FieldRef::CreatedAt => Target { expr: "d.created_at".into(), kind: Kind::Text, json_args: None },
            FieldRef::UpdatedAt => Target { expr: "d.updated_at".into(), kind: Kind::Text, json_args: None },
            FieldRef::Version => Target { expr: "d.version".into(), kind: Kind::Integer, json_args: None },
            FieldRef::Data(path) => {
                // `alias.rest` reads the payload attached by a join.
                if let Some((head, rest)) = path.split_once('.') {
                    if let Some(i) = self.query.joins.iter().position(|j| j.alias() == head) {
                        return Self::json_target(&format!("j{}", i), rest);
                    }
                }
                if self.extracted.iter().any(|f| f == path) {
                    let json = Self::json_target("d", path);
                    return Target {
                        expr: format!("x.{}", extract_column(path)),
                        kind: Kind::Json,
                        json_args: json.json_args,
                    };
                }
                Self::json_target("d", path)
            }
        }
    }

    /// Resolve a field of a joined collection: always a payload path.
    fn joined_target(index: usize, field: &str) -> Target {
        Self::json_target(&format!("j{}", index), field.strip_prefix("data.").unwrap_or(field))
    }

    fn target_for(&self, condition: &FilterCondition) -> Result<Target> {
        match condition.collection.as_deref() {
            None => Ok(self.primary_target(&condition.field)),
            Some(scope) if scope == self.query.collection => Ok(self.primary_target(&condition.field)),
            Some(scope) => match self.join_index(scope) {
                Some(i) => Ok(Self::joined_target(i, &condition.field)),
                None => Err(Error::Query(format!("unknown collection '{}'", scope))),
            },
        }
    }

    /// Clause restricting `target` to values comparable with `expected`.
    ///
    /// `Some("1=0")` means the comparison can never hold.
    fn type_guard(target: &Target, expected: &Value) -> Option<String> {
        let wanted = match expected {
            Value::Number(_) => "('integer', 'real')",
            Value::String(_) => "('text')",
            Value::Bool(_) => "('true', 'false')",
            _ => return Some("1=0".into()),
        };
        match target.kind {
            Kind::Json => Some(format!(
                "JSON_TYPE({}) IN {}",
                target.json_args.as_deref().unwrap_or_default(),
                wanted
            )),
            Kind::Text if expected.is_string() => None,
            Kind::Integer if expected.is_number() => None,
            _ => Some("1=0".into()),
        }
    }

    fn condition(&mut self, c: &FilterCondition) -> Result<String> {
        validate_field_path(&c.field)?;
        let t = self.target_for(c)?;
        let e = t.expr.clone();
        let value = c.value.clone();

        let clause = match c.operator {
            FilterOperator::IsNull => format!("{} IS NULL", e),
            FilterOperator::IsNotNull => format!("{} IS NOT NULL", e),
            FilterOperator::Eq if value.is_null() => format!("{} IS NULL", e),
            FilterOperator::Ne if value.is_null() => format!("{} IS NOT NULL", e),
            FilterOperator::Eq | FilterOperator::Ne if value.is_boolean() && t.kind == Kind::Json => {
                let json_type = format!("JSON_TYPE({})", t.json_args.as_deref().unwrap_or_default());
                let literal = if value == Value::Bool(true) { "'true'" } else { "'false'" };
                if c.operator == FilterOperator::Eq {
                    format!("{} = {}", json_type, literal)
                } else {
                    format!("COALESCE({}, 'null') != {}", json_type, literal)
                }
            }
            FilterOperator::Eq | FilterOperator::Ne if value.is_number() && t.kind == Kind::Json => {
                let json_type = format!("JSON_TYPE({})", t.json_args.as_deref().unwrap_or_default());
                let equal = format!(
                    "({} IN ('integer', 'real') AND {} = {})",
                    json_type,
                    e,
                    self.bind(value)
                );
                if c.operator == FilterOperator::Eq {
                    equal
                } else {
                    format!("({e} IS NULL OR NOT {})", equal, e = e)
                }
            }
            FilterOperator::Eq => format!("{} = {}", e, self.bind(value)),
            FilterOperator::Ne => format!("({e} IS NULL OR {e} != {})", self.bind(value), e = e),
            FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte => {
                let op = match c.operator {
                    FilterOperator::Gt => ">",
                    FilterOperator::Gte => ">=",
                    FilterOperator::Lt => "<",
                    _ => "<=",
                };
                match Self::type_guard(&t, &value) {
                    Some(never) if never == "1=0" => never,
                    Some(guard) => format!("({} AND {} {} {})", guard, e, op, self.bind(value)),
                    None => format!("{} {} {}", e, op, self.bind(value)),
                }
            }
            FilterOperator::Contains => {
                let needle = match &value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Ok("1=0".into()),
                };
                let pattern = format!("%{}%", escape_like(&needle));
                let like = format!("{} LIKE {} ESCAPE '\\'", e, self.bind(Value::String(pattern)));
                match t.kind {
                    Kind::Json => format!(
                        "(JSON_TYPE({}) IN ('text', 'integer', 'real') AND {})",
                        t.json_args.as_deref().unwrap_or_default(),
                        like
                    ),
                    _ => like,
                }
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let members = value.as_array().ok_or_else(|| {
                    Error::Query(format!("operator on '{}' requires an array value", c.field))
                })?;
                let negate = c.operator == FilterOperator::NotIn;
                let mut flags: Vec<bool> = Vec::new();
                let mut scalars = Vec::new();
                for member in members {
                    match member {
                        Value::Null => {}
                        Value::Bool(flag) if !flags.contains(flag) => flags.push(*flag),
                        Value::Bool(_) => {}
                        other => scalars.push(other.clone()),
                    }
                }
                let json_type = format!("JSON_TYPE({})", t.json_args.as_deref().unwrap_or_default());

                let mut alternatives = Vec::new();
                if !scalars.is_empty() {
                    let n = scalars.len();
                    self.params.extend(scalars);
                    let list = format!("{} IN ({})", e, quote_list(n));
                    alternatives.push(match t.kind {
                        // JSON booleans extract as 0 and 1.
                        Kind::Json => format!("({} NOT IN ('true', 'false') AND {})", json_type, list),
                        _ => list,
                    });
                }
                if !flags.is_empty() && t.kind == Kind::Json {
                    let literals: Vec<&str> = flags
                        .iter()
                        .map(|flag| if *flag { "'true'" } else { "'false'" })
                        .collect();
                    alternatives.push(format!("{} IN ({})", json_type, literals.join(", ")));
                }

                if alternatives.is_empty() {
                    return Ok(if negate { "1=1" } else { "1=0" }.into());
                }
                let matched = alternatives.join(" OR ");
                if negate {
                    format!("({e} IS NULL OR NOT ({}))", matched, e = e)
                } else {
                    format!("({})", matched)
                }
            }
        };
        Ok(clause)
    }

    fn filter(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::Condition(c) => self.condition(c),
            Filter::Group(g) => {
                if g.conditions.is_empty() {
                    return Ok(match g.operator {
                        LogicalOperator::And => "1=1".into(),
                        LogicalOperator::Or => "1=0".into(),
                    });
                }
                let glue = match g.operator {
                    LogicalOperator::And => " AND ",
                    LogicalOperator::Or => " OR ",
                };
                let parts = g
                    .conditions
                    .iter()
                    .map(|f| self.filter(f))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(glue)))
            }
        }
    }

    fn from_clause(&mut self) -> Result<String> {
        let mut sql = String::from("FROM _data d");
        if self.uses_extraction() {
            sql.push_str(&format!(
                " LEFT JOIN {} x ON x.id = d.id",
                extract_table(&self.query.collection)
            ));
        }
        let joins = self.query.joins.clone();
        for (i, join) in joins.iter().enumerate() {
            validate_field_path(&join.on.local)?;
            validate_field_path(&join.on.foreign)?;
            let kind = match join.join_type {
                JoinType::Inner => "INNER JOIN",
                JoinType::Left => "LEFT JOIN",
            };
            let alias = format!("j{}", i);
            let foreign = match resolve_field(&join.on.foreign) {
                FieldRef::Id => format!("{}.id", alias),
                FieldRef::CreatedAt => format!("{}.created_at", alias),
                FieldRef::UpdatedAt => format!("{}.updated_at", alias),
                FieldRef::Version => format!("{}.version", alias),
                FieldRef::Data(path) => format!("JSON_EXTRACT({}.data, {})", alias, json_path(path)),
            };
            // Earlier joins only: a local key cannot see later aliases.
            let local = self.primary_target(&join.on.local).expr;
            sql.push_str(&format!(
                " {} _data {a} ON {a}.collection = {} AND {} = {}",
                kind,
                self.bind(Value::String(join.collection.clone())),
                foreign,
                local,
                a = alias,
            ));
        }
        Ok(sql)
    }

    fn where_clause(&mut self) -> Result<String> {
        let collection = Value::String(self.query.collection.clone());
        let mut clauses = vec![format!("d.collection = {}", self.bind(collection))];
        if let Some(range) = self.query.time_range.clone() {
            if let Some(start) = range.start {
                clauses.push(format!("d.created_at >= {}", self.bind(Value::String(timestamp_string(&start)))));
            }
            if let Some(end) = range.end {
                clauses.push(format!("d.created_at <= {}", self.bind(Value::String(timestamp_string(&end)))));
            }
        }
        for tag in self.query.tags.clone().into_iter().flatten() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(d.tags) WHERE json_each.value = {})",
                self.bind(Value::String(tag))
            ));
        }
        if let Some(filter) = &self.query.filter {
            clauses.push(self.filter(filter)?);
        }
        Ok(format!("WHERE {}", clauses.join(" AND ")))
    }

    fn limit_clause(&mut self) -> String {
        match (self.query.limit, self.query.offset) {
            (None, None) => String::new(),
            (limit, offset) => {
                let limit = limit.map_or(-1, |l| l as i64);
                format!(
                    " LIMIT {} OFFSET {}",
                    self.bind(Value::from(limit)),
                    self.bind(Value::from(offset.unwrap_or(0) as u64))
                )
            }
        }
    }

    fn direction(d: SortDirection) -> &'static str {
        match d {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Group key expression plus whether it yields JSON text.
    fn group_key(&self, field: &str) -> (String, bool) {
        let target = self.primary_target(field);
        match target.kind {
            Kind::Json => {
                let args = target.json_args.unwrap_or_default();
                // `->` keeps type information (strings stay quoted), so 1
                // and "1" land in different groups. Missing reads as null.
                let (table, path) = args.split_once(", ").unwrap_or(("d.data", "'$'"));
                (format!("COALESCE({} -> {}, 'null')", table, path), true)
            }
            _ => (target.expr, false),
        }
    }

    fn compile_records(&mut self) -> Result<CompiledQuery> {
        let from = self.from_clause()?;
        let where_clause = self.where_clause()?;
        let mut order = Vec::new();
        for spec in self.query.sort.clone() {
            validate_field_path(&spec.field)?;
            order.push(format!(
                "{} {}",
                self.primary_target(&spec.field).expr,
                Self::direction(spec.direction)
            ));
        }
        order.push("d.created_at ASC".into());
        order.push("d.id ASC".into());

        let mut columns = RECORD_COLUMNS.to_string();
        for i in 0..self.query.joins.len() {
            columns.push_str(&format!(", j{}.data", i));
        }
        let limit = self.limit_clause();
        let sql = format!(
            "SELECT {} {} {} ORDER BY {}{}",
            columns,
            from,
            where_clause,
            order.join(", "),
            limit
        );
        Ok(CompiledQuery {
            sql,
            params: std::mem::take(&mut self.params),
            shape: RowShape::Records {
                join_aliases: self.query.joins.iter().map(|j| j.alias().to_string()).collect(),
            },
        })
    }

    fn compile_groups(&mut self) -> Result<CompiledQuery> {
        let from = self.from_clause()?;
        let where_clause = self.where_clause()?;

        let mut select = Vec::new();
        let mut columns = Vec::new();
        let mut group_exprs = Vec::new();
        for (i, field) in self.query.group_by.iter().enumerate() {
            validate_field_path(field)?;
            let (expr, json) = self.group_key(field);
            select.push(format!("{} AS g{}", expr, i));
            group_exprs.push(format!("g{}", i));
            columns.push(GroupColumn { name: field.clone(), json });
        }
        for (i, agg) in self.query.aggregations.iter().enumerate() {
            let expr = match (&agg.field, agg.function) {
                (None, _) => "COUNT(*)".to_string(),
                (Some(field), AggregateFunction::Count) => {
                    format!("COUNT({})", self.primary_target(field).expr)
                }
                (Some(field), AggregateFunction::Sum | AggregateFunction::Avg) => {
                    let t = self.primary_target(field);
                    let numeric = match t.kind {
                        Kind::Json => format!(
                            "CASE WHEN JSON_TYPE({}) IN ('integer', 'real') THEN {} END",
                            t.json_args.as_deref().unwrap_or_default(),
                            t.expr
                        ),
                        Kind::Integer => t.expr,
                        Kind::Text => "NULL".to_string(),
                    };
                    format!("{}({})", agg.function.as_sql(), numeric)
                }
                (Some(field), func) => format!("{}({})", func.as_sql(), self.primary_target(field).expr),
            };
            select.push(format!("{} AS a{}", expr, i));
            columns.push(GroupColumn { name: agg.alias.clone(), json: false });
        }

        let mut order = Vec::new();
        if self.query.sort.is_empty() {
            for field in self.query.group_by.clone() {
                order.push(format!("{} ASC", self.primary_target(&field).expr));
            }
        } else {
            for spec in self.query.sort.clone() {
                let dir = Self::direction(spec.direction);
                if self.query.group_by.contains(&spec.field) {
                    order.push(format!("{} {}", self.primary_target(&spec.field).expr, dir));
                } else if let Some(i) = self.query.aggregations.iter().position(|a| a.alias == spec.field) {
                    order.push(format!("a{} {}", i, dir));
                } else {
                    return Err(Error::Query(format!(
                        "grouped query can only sort on group keys or aggregate aliases, got '{}'",
                        spec.field
                    )));
                }
            }
        }

        let mut sql = format!("SELECT {} {} {}", select.join(", "), from, where_clause);
        if !group_exprs.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_exprs.join(", ")));
        }
        if !order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        sql.push_str(&self.limit_clause());
        Ok(CompiledQuery {
            sql,
            params: std::mem::take(&mut self.params),
            shape: RowShape::Groups { columns },
        })
    }

    pub fn compile(mut self) -> Result<CompiledQuery> {
        self.query.validate()?;
        if self.query.is_aggregate() {
            self.compile_groups()
        } else {
            self.compile_records()
        }
    }
}

/// Compile `query`; `extracted` lists the primary collection's registered
/// extraction fields.
pub fn compile(query: &RelationalQuery, extracted: &[String]) -> Result<CompiledQuery> {
    Translator::new(query, extracted).compile()
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
