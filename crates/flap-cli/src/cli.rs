use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "flap",
    about = "Flapjack record store: inspect the schema and query fixture data",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List classes, attributes, indexes, and associations
    Schema,
    /// Seed an in-memory store from a fixture file and report the result
    Load(LoadArgs),
    /// Seed from a fixture file, then run a query against it
    Query(QueryArgs),
}

#[derive(Args)]
pub struct LoadArgs {
    /// JSON fixture file; falls back to `fixtures` in the config
    #[arg(long)]
    pub fixtures: Option<PathBuf>,
}

#[derive(Args)]
pub struct QueryArgs {
    #[arg(long)]
    pub fixtures: Option<PathBuf>,
    /// Class to query
    #[arg(long)]
    pub class: String,
    /// Equality filter, `attribute=value`; repeat to intersect
    #[arg(long = "where", value_name = "ATTR=VALUE")]
    pub filters: Vec<String>,
    /// Sortable attribute to order by
    #[arg(long)]
    pub sort: Option<String>,
    #[arg(long, requires = "sort")]
    pub desc: bool,
    /// 1-based page number
    #[arg(long)]
    pub page: Option<usize>,
    #[arg(long, default_value = "20")]
    pub per_page: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_with_repeated_filters() {
        let cli = Cli::try_parse_from([
            "flap", "--format", "json", "query", "--class", "check", "--where", "enabled=true",
            "--where", "name=PING", "--sort", "name", "--page", "2",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::Query(args) => {
                assert_eq!(args.class, "check");
                assert_eq!(args.filters, vec!["enabled=true", "name=PING"]);
                assert_eq!(args.sort.as_deref(), Some("name"));
                assert_eq!(args.page, Some(2));
                assert_eq!(args.per_page, 20);
                assert!(!args.desc);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn desc_requires_sort() {
        assert!(Cli::try_parse_from(["flap", "query", "--class", "check", "--desc"]).is_err());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["flap", "schema", "--verbose", "--config", "flap.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("flap.toml")));
    }
}
