//! Query command implementation.

use super::StoreArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use docstore_core::query::builder::QueryBuilder;
use docstore_core::query::{Filter, RelationalQuery, SortDirection};
use serde_json::Value;

pub struct QueryArgs {
    pub collection: String,
    pub filter: Option<String>,
    pub sort: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub explain: bool,
}

/// Turn command-line arguments into a relational query.
pub fn build(args: &QueryArgs) -> Result<RelationalQuery> {
    let mut builder = QueryBuilder::new().from(args.collection.as_str());

    if let Some(raw) = &args.filter {
        let parsed: Value = serde_json::from_str(raw).context("--filter is not valid JSON")?;
        let map = parsed
            .as_object()
            .context("--filter must be a JSON object")?;
        if let Some(filter) = Filter::from_legacy(map) {
            builder = builder.where_filter(filter);
        }
    }
    for field in &args.sort {
        builder = match field.strip_prefix('-') {
            Some(field) => builder.order_by(field, SortDirection::Desc),
            None => builder.order_by(field.as_str(), SortDirection::Asc),
        };
    }
    if let Some(limit) = args.limit {
        builder = builder.limit(limit);
    }
    if let Some(offset) = args.offset {
        builder = builder.offset(offset);
    }
    Ok(builder.build()?)
}

/// Run the query command.
pub async fn run(store_args: &StoreArgs, args: QueryArgs) -> Result<()> {
    let query = build(&args)?;
    let store = super::open(store_args).await?;

    if args.explain {
        let explanation = store.explain_query(&query).await?;
        println!("{} {} plan", "→".blue(), explanation.backend);
        println!("  {}", explanation.query.dimmed());
        if !explanation.parameters.is_empty() {
            println!("  Parameters: {}", Value::Array(explanation.parameters.clone()));
        }
        for line in &explanation.plan {
            println!("  {} {}", "•".dimmed(), line);
        }
        if let Some(rows) = explanation.estimated_rows {
            println!("  Estimated rows: {}", rows);
        }
    } else {
        let output = store.query_relational(&query).await?;
        for record in &output.records {
            println!("{}", serde_json::to_string_pretty(record)?);
        }
        eprintln!("{} {} record(s)", "✓".green(), output.records.len());
    }

    store.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> QueryArgs {
        QueryArgs {
            collection: "users".into(),
            filter: None,
            sort: Vec::new(),
            limit: None,
            offset: None,
            explain: false,
        }
    }

    #[test]
    fn test_build_parses_filter_and_sort() {
        let query = build(&QueryArgs {
            filter: Some(r#"{"age": {"$gte": 18}, "city": "London"}"#.into()),
            sort: vec!["-age".into(), "name".into()],
            limit: Some(5),
            ..args()
        })
        .unwrap();
        assert_eq!(query.collection, "users");
        assert_eq!(query.filter.unwrap().conditions().len(), 2);
        assert_eq!(query.sort.len(), 2);
        assert_eq!(query.sort[0].direction, SortDirection::Desc);
        assert_eq!(query.sort[0].field, "age");
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn test_build_rejects_non_object_filter() {
        assert!(build(&QueryArgs {
            filter: Some("[1, 2]".into()),
            ..args()
        })
        .is_err());
    }
}
