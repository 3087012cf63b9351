use anyhow::Context;
use clap::{Parser, Subcommand};
use pgdoc::sql::{ddl::Ddl, statements, AggregationCompiler};
use pgdoc::{AdapterConfig, FindOptions, PredicateCompiler, Schema, SortDirection, Statement};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pgdoc")]
#[command(about = "Compile document queries into PostgreSQL statements", long_about = None)]
struct Args {
    /// Directory holding pgdoc.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a find
    Query {
        /// Schema JSON file
        #[arg(long, short)]
        schema: PathBuf,

        /// Query document, inline or @file
        #[arg(default_value = "{}")]
        query: String,

        /// Projected keys, comma separated
        #[arg(long)]
        keys: Option<String>,

        /// Sort document such as {"score": -1}
        #[arg(long)]
        sort: Option<String>,

        #[arg(long)]
        limit: Option<u64>,

        #[arg(long)]
        skip: Option<u64>,

        /// Compare strings case insensitively
        #[arg(long)]
        case_insensitive: bool,

        /// Wrap the statement in EXPLAIN ANALYZE
        #[arg(long)]
        explain: bool,
    },

    /// Compile an update by query
    Update {
        #[arg(long, short)]
        schema: PathBuf,

        /// Query document, inline or @file
        query: String,

        /// Update document, inline or @file
        update: String,
    },

    /// Print the DDL creating a class
    Ddl {
        #[arg(long, short)]
        schema: PathBuf,
    },

    /// Compile an aggregation pipeline
    Aggregate {
        #[arg(long, short)]
        schema: PathBuf,

        /// Pipeline array, inline or @file
        pipeline: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgdoc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AdapterConfig::load(&args.config_dir)?;

    let statements = match args.command {
        Command::Query {
            schema,
            query,
            keys,
            sort,
            limit,
            skip,
            case_insensitive,
            explain,
        } => {
            let schema = load_schema(&schema)?;
            let mut options = FindOptions {
                limit,
                skip,
                case_insensitive,
                explain,
                ..Default::default()
            };
            if let Some(keys) = keys {
                options = options.keys(keys.split(',').map(str::trim).filter(|k| !k.is_empty()));
            }
            if let Some(sort) = sort {
                if let Value::Object(sort) = parse_json(&sort)? {
                    for (field, direction) in &sort {
                        options = options.sort_by(field.clone(), SortDirection::from_value(direction));
                    }
                }
            }
            vec![statements::find(&predicates(&schema, &config, case_insensitive), &parse_json(&query)?, &options)?]
        }
        Command::Update { schema, query, update } => {
            let schema = load_schema(&schema)?;
            vec![statements::update(
                &predicates(&schema, &config, false),
                &parse_json(&query)?,
                &parse_json(&update)?,
            )?]
        }
        Command::Ddl { schema } => {
            let schema = load_schema(&schema)?;
            let ddl = Ddl::new(config.schema_table.clone(), config.join_id_width);
            let mut out = vec![ddl.create_schema_table(), ddl.create_table(&schema)?];
            for (field, _) in schema.relation_fields() {
                out.push(ddl.create_join_table(&schema.class_name, field));
            }
            out.push(ddl.insert_schema(&schema)?);
            out
        }
        Command::Aggregate { schema, pipeline } => {
            let schema = load_schema(&schema)?;
            let pipeline = match parse_json(&pipeline)? {
                Value::Array(stages) => stages,
                other => vec![other],
            };
            let compiler = AggregationCompiler::new(predicates(&schema, &config, false));
            vec![compiler.compile(&schema.class_name, &pipeline)?.statement]
        }
    };

    print_statements(&statements)
}

fn predicates(schema: &Schema, config: &AdapterConfig, case_insensitive: bool) -> PredicateCompiler {
    PredicateCompiler::new(schema)
        .case_insensitive(case_insensitive)
        .text_language(config.text_search_language.clone())
}

fn load_schema(path: &Path) -> anyhow::Result<Schema> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    let schema: Schema = serde_json::from_str(&content)
        .with_context(|| format!("Invalid schema in {}", path.display()))?;
    if schema.class_name.is_empty() {
        anyhow::bail!("Schema {} has no className", path.display());
    }
    Ok(schema)
}

/// Inline JSON, or the contents of a file when prefixed with `@`
fn parse_json(arg: &str) -> anyhow::Result<Value> {
    let content = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&content)?)
}

fn print_statements(statements: &[Statement]) -> anyhow::Result<()> {
    for statement in statements {
        println!("{}", statement.sql);
        if !statement.params.is_empty() {
            println!("  params: {}", serde_json::to_string(&statement.params)?);
        }
    }
    Ok(())
}
