use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use flap_data::jsonapi::{self, Pagination};
use flap_kv::InMemoryKv;
use flap_record::{
    Cardinality, ClassDef, Filter, Query, Record, RecordStore, SchemaRegistry, Value, ID_ATTRIBUTE,
};
use serde_json::{json, Value as Json};

use crate::cli::*;
use crate::config::CliConfig;
use crate::fixtures::{self, LoadReport};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Schema => cmd_schema(cli.format),
        Command::Load(args) => cmd_load(&config, args, cli.format),
        Command::Query(args) => cmd_query(&config, args, cli.format),
    }
}

fn open_store(config: &CliConfig) -> anyhow::Result<RecordStore> {
    Ok(RecordStore::new(
        Arc::new(InMemoryKv::new()),
        flap_data::schema()?,
        config.store.clone(),
    ))
}

fn seeded_store(
    config: &CliConfig,
    fixtures: Option<std::path::PathBuf>,
) -> anyhow::Result<(RecordStore, LoadReport)> {
    let store = open_store(config)?;
    let path = config.fixtures_path(fixtures)?;
    let report = fixtures::seed(&store, &fixtures::read(&path)?)?;
    Ok((store, report))
}

// ----------------------------------------------------------------
// schema
// ----------------------------------------------------------------

fn cmd_schema(format: OutputFormat) -> anyhow::Result<()> {
    let schema = flap_data::schema()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&schema_json(&schema))?),
        OutputFormat::Text => {
            for class in schema.classes() {
                println!("{}", class.name().bold());
                for attr in class.attributes() {
                    println!(
                        "  {:<20} {:<10} {}",
                        attr.name,
                        attr.attr_type.to_string().cyan(),
                        index_flags(class, &attr.name).join(" ").dimmed()
                    );
                }
                for assoc in schema.associations_of(class.name()) {
                    println!(
                        "  {} {} {} ({})",
                        "→".green(),
                        assoc.name.yellow(),
                        assoc.target,
                        cardinality_name(assoc.cardinality)
                    );
                }
            }
        }
    }
    Ok(())
}

fn index_flags(class: &ClassDef, attribute: &str) -> Vec<&'static str> {
    let Some(def) = class.attribute_def(attribute) else {
        return Vec::new();
    };
    let mut flags = Vec::new();
    if def.indexed {
        flags.push("indexed");
    }
    if def.unique {
        flags.push("unique");
    }
    if def.sortable {
        flags.push("sortable");
    }
    flags
}

fn cardinality_name(cardinality: Cardinality) -> &'static str {
    match cardinality {
        Cardinality::OneToMany => "has_many",
        Cardinality::ManyToMany => "has_and_belongs_to_many",
    }
}

fn schema_json(schema: &SchemaRegistry) -> Json {
    let classes: Vec<Json> = schema
        .classes()
        .map(|class| {
            let attributes: Vec<Json> = class
                .attributes()
                .map(|attr| {
                    json!({
                        "name": attr.name,
                        "type": attr.attr_type,
                        "flags": index_flags(class, &attr.name),
                    })
                })
                .collect();
            let associations: Vec<Json> = schema
                .associations_of(class.name())
                .map(|assoc| {
                    json!({
                        "name": assoc.name,
                        "target": assoc.target,
                        "kind": cardinality_name(assoc.cardinality),
                        "inverse": assoc.inverse,
                    })
                })
                .collect();
            json!({
                "name": class.name(),
                "attributes": attributes,
                "associations": associations,
            })
        })
        .collect();
    json!({ "classes": classes })
}

// ----------------------------------------------------------------
// load
// ----------------------------------------------------------------

fn cmd_load(config: &CliConfig, args: LoadArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (_store, report) = seeded_store(config, args.fixtures)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            for (class, saved) in &report.saved {
                println!("{} {:<24} {}", "✓".green(), class, saved.to_string().bold());
            }
            println!("  links: {}", report.links);
            for failure in &report.failures {
                println!(
                    "{} {} {}: {}",
                    "✗".red().bold(),
                    failure.class,
                    failure.id.as_deref().unwrap_or("(new)").yellow(),
                    failure.reason
                );
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------
// query
// ----------------------------------------------------------------

fn cmd_query(config: &CliConfig, args: QueryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (store, _report) = seeded_store(config, args.fixtures.clone())?;
    let class = store.schema().class(&args.class)?;
    let filter = parse_filter(&class, &args.filters)?;

    let mut query = store.intersect(&args.class, filter)?;
    if let Some(sort) = &args.sort {
        query = if args.desc {
            query.sort_desc(sort)
        } else {
            query.sort(sort)
        };
    }
    let pagination = match args.page {
        Some(page) => {
            query = query.page(page, args.per_page);
            Some(Pagination::for_query(&query, page, args.per_page)?)
        }
        None => None,
    };

    let records = query.all()?;
    match format {
        OutputFormat::Json => {
            let doc = jsonapi::document(&store, &args.class, &records, None, pagination)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => print_records(&query, &records, pagination)?,
    }
    Ok(())
}

/// Turn `attr=value` clauses into an intersect filter, decoding each value
/// with the attribute's declared type.
fn parse_filter(class: &ClassDef, clauses: &[String]) -> anyhow::Result<Filter> {
    let mut filter = Filter::new();
    for clause in clauses {
        let (attribute, raw) = clause
            .split_once('=')
            .with_context(|| format!("expected ATTR=VALUE, got {clause:?}"))?;
        let value = if attribute == ID_ATTRIBUTE {
            Value::String(raw.to_string())
        } else {
            let def = class
                .attribute_def(attribute)
                .with_context(|| format!("{} has no attribute {attribute}", class.name()))?;
            def.attr_type
                .decode(raw)
                .with_context(|| format!("bad value for {attribute}"))?
        };
        filter = filter.eq(attribute, value);
    }
    Ok(filter)
}

fn print_records(
    query: &Query<'_>,
    records: &[Record],
    pagination: Option<Pagination>,
) -> anyhow::Result<()> {
    match pagination {
        Some(p) => println!(
            "{} {} (page {} of {})",
            p.total_count.to_string().bold(),
            query.class().name(),
            p.page,
            p.total_pages
        ),
        None => println!("{} {}", records.len().to_string().bold(), query.class().name()),
    }
    for record in records {
        println!("{}", record.id().unwrap_or_default().yellow().bold());
        for (name, value) in record.attributes()? {
            println!("  {:<20} {}", name, value.to_json());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_class() -> Arc<ClassDef> {
        flap_data::schema().unwrap().class("check").unwrap()
    }

    #[test]
    fn filters_decode_by_attribute_type() {
        let filter = parse_filter(
            &check_class(),
            &["enabled=true".to_string(), "id=c1".to_string()],
        )
        .unwrap();
        let conditions: Vec<(&str, &[Value])> = filter.conditions().collect();
        assert!(conditions.contains(&("enabled", &[Value::Boolean(true)][..])));
        assert!(conditions.contains(&("id", &[Value::String("c1".into())][..])));
    }

    #[test]
    fn bad_filters_are_rejected() {
        let class = check_class();
        assert!(parse_filter(&class, &["enabled".to_string()]).is_err());
        assert!(parse_filter(&class, &["colour=red".to_string()]).is_err());
        assert!(parse_filter(&class, &["enabled=maybe".to_string()]).is_err());
    }

    #[test]
    fn schema_json_lists_every_class() {
        let doc = schema_json(&flap_data::schema().unwrap());
        let classes = doc["classes"].as_array().unwrap();
        assert_eq!(classes.len(), 5);
        let check = classes.iter().find(|c| c["name"] == "check").unwrap();
        let name = check["attributes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|a| a["name"] == "name")
            .unwrap();
        assert_eq!(name["flags"], json!(["indexed", "unique", "sortable"]));
        assert_eq!(name["type"], json!("string"));
    }
}
