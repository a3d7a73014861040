//! tsindex CLI
//!
//! Command-line access to a directory-backed metric index:
//! - Resolve series ids for a data point
//! - List series of a metric, filtered and grouped by tags
//! - Suggest namespaces, metrics, tag keys and tag values

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tsindex::config::{generate_default_config, Config, LoggingConfig};
use tsindex::index::{
    FieldType, MetricIndexSegment, MetricMetaDatabase, ShardExecuteContext, TagFilter,
};
use tsindex::types::{month_key, TimeRange};

#[derive(Parser)]
#[command(name = "tsindex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Metric index for time-series data")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file
    InitConfig {
        /// Output path (default: stdout)
        output: Option<PathBuf>,
    },

    /// Resolve metric and series ids for a data point
    Resolve {
        /// Metric name
        metric: String,
        /// Namespace (default: default-ns)
        #[arg(short, long, default_value = "")]
        namespace: String,
        /// Tags in key=value format
        #[arg(short = 'T', long)]
        tags: Vec<String>,
        /// Fields in name:type format (sum, min, max, last, first, histogram)
        #[arg(short, long)]
        fields: Vec<String>,
        /// Timestamp: "now", RFC 3339 or Unix milliseconds
        #[arg(short = 't', long, default_value = "now")]
        time: String,
        /// Tag hash (default: computed from the tags)
        #[arg(long)]
        tag_hash: Option<u64>,
    },

    /// List series of a metric
    Series {
        /// Metric name
        metric: String,
        #[arg(short, long, default_value = "")]
        namespace: String,
        /// Days back from now
        #[arg(short, long, default_value = "30")]
        last: i64,
        /// Tag filters in key=pattern format (pattern may start/end with *)
        #[arg(short = 'T', long)]
        tags: Vec<String>,
        /// Group series by these tag keys
        #[arg(short, long)]
        group_by: Vec<String>,
    },

    /// Prefix suggestions
    Suggest {
        #[command(subcommand)]
        target: SuggestTarget,
        /// Maximum number of results
        #[arg(short, long, default_value = "20", global = true)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum SuggestTarget {
    Namespaces {
        #[arg(default_value = "")]
        prefix: String,
    },
    Metrics {
        namespace: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    TagKeys {
        namespace: String,
        metric: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    TagValues {
        namespace: String,
        metric: String,
        tag_key: String,
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.index.data_dir = dir.to_string_lossy().to_string();
    }

    init_logging(&config.logging);

    if let Commands::InitConfig { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing config to {}", path.display()))?;
                println!("Wrote {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let index = Index::open(&config)?;
    let result = run(&index, cli.command).await;
    let closed = index.close().await;
    result?;
    closed
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tsindex={}", config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

struct Index {
    meta: Arc<MetricMetaDatabase>,
    segment: MetricIndexSegment,
}

impl Index {
    fn open(config: &Config) -> anyhow::Result<Self> {
        let data_dir = config.index.data_dir();
        let index_config = config.index.to_index_config();
        tracing::debug!("Data directory: {:?}", data_dir);

        let meta = Arc::new(MetricMetaDatabase::open_with_config(
            data_dir.join("meta"),
            &index_config,
        )?);
        let segment = MetricIndexSegment::open(data_dir.join("series"), Arc::clone(&meta), index_config)?;
        Ok(Self { meta, segment })
    }

    async fn close(self) -> anyhow::Result<()> {
        self.segment.close().await?;
        self.meta.close().await?;
        Ok(())
    }

    fn metric_id(&self, namespace: &str, metric: &str) -> anyhow::Result<u32> {
        match self.meta.get_metric_id(namespace, metric)? {
            Some(id) => Ok(id),
            None => bail!("Unknown metric {}/{}", display_namespace(namespace), metric),
        }
    }
}

async fn run(index: &Index, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::InitConfig { .. } => Ok(()),

        Commands::Resolve {
            metric,
            namespace,
            tags,
            fields,
            time,
            tag_hash,
        } => {
            let timestamp = parse_time(&time)?;
            let tags = parse_pairs(&tags, '=')?;
            let tag_hash = tag_hash.unwrap_or_else(|| hash_tags(&tags));

            let (metric_id, series_id) = index
                .segment
                .gen_series_id(timestamp, &namespace, &metric, tags, tag_hash)
                .await?;

            println!("metric_id:  {}", metric_id);
            println!("series_id:  {}", series_id);
            println!("tag_hash:   {}", tag_hash);
            if let Some(month) = month_key(timestamp) {
                println!("month:      {}", month);
            }

            for (name, kind) in parse_pairs(&fields, ':')? {
                let field_type: FieldType = kind.parse().map_err(anyhow::Error::msg)?;
                let field_id = index
                    .meta
                    .gen_field_id(&namespace, &metric, &name, field_type)
                    .await?;
                println!("field {:<12} id={} type={}", name, field_id, field_type);
            }
            Ok(())
        }

        Commands::Series {
            metric,
            namespace,
            last,
            tags,
            group_by,
        } => {
            let metric_id = index.metric_id(&namespace, &metric)?;
            let range = TimeRange::last_days(last);
            let mut series = index.segment.get_series_ids_for_metric(metric_id, &range)?;

            for (key, pattern) in parse_pairs(&tags, '=')? {
                let matched = match index.meta.get_tag_key_id(metric_id, &key)? {
                    Some(tag_key_id) => index.segment.get_series_ids_by_expr(
                        tag_key_id,
                        &TagFilter::Like(pattern),
                        &range,
                    )?,
                    None => RoaringBitmap::new(),
                };
                series &= matched;
            }

            if group_by.is_empty() {
                println!("{} series", series.len());
                let ids: Vec<String> = series.iter().map(|id| id.to_string()).collect();
                if !ids.is_empty() {
                    println!("{}", ids.join(" "));
                }
                return Ok(());
            }

            print_groups(index, metric_id, &group_by, range, series)
        }

        Commands::Suggest { target, limit } => {
            let suggestions = match target {
                SuggestTarget::Namespaces { prefix } => index.meta.suggest_namespace(&prefix, limit)?,
                SuggestTarget::Metrics { namespace, prefix } => {
                    index.meta.suggest_metrics(&namespace, &prefix, limit)?
                }
                SuggestTarget::TagKeys {
                    namespace,
                    metric,
                    prefix,
                } => {
                    let metric_id = index.metric_id(&namespace, &metric)?;
                    index.meta.suggest_tag_keys(metric_id, &prefix, limit)?
                }
                SuggestTarget::TagValues {
                    namespace,
                    metric,
                    tag_key,
                    prefix,
                } => {
                    let metric_id = index.metric_id(&namespace, &metric)?;
                    match index.meta.get_tag_key_id(metric_id, &tag_key)? {
                        Some(tag_key_id) => index.meta.suggest_tag_values(tag_key_id, &prefix, limit)?,
                        None => Vec::new(),
                    }
                }
            };

            for suggestion in suggestions {
                println!("{}", suggestion);
            }
            Ok(())
        }
    }
}

fn print_groups(
    index: &Index,
    metric_id: u32,
    group_by: &[String],
    range: TimeRange,
    series: RoaringBitmap,
) -> anyhow::Result<()> {
    let mut tag_key_ids = Vec::with_capacity(group_by.len());
    for key in group_by {
        match index.meta.get_tag_key_id(metric_id, key)? {
            Some(id) => tag_key_ids.push(id),
            None => bail!("Unknown tag key {}", key),
        }
    }

    let mut ctx = ShardExecuteContext::new(tag_key_ids.clone(), range, series);
    let grouping = match index.segment.get_grouping_context(&mut ctx) {
        Ok(grouping) => grouping,
        Err(e) => {
            tracing::debug!("No groups: {}", e);
            println!("0 groups");
            return Ok(());
        }
    };
    let groups = grouping.group_series(&ctx.series_ids);

    // tag value ids → values, per tag key
    let mut names: Vec<HashMap<u32, String>> = Vec::with_capacity(tag_key_ids.len());
    for (pos, tag_key_id) in tag_key_ids.iter().enumerate() {
        let ids: RoaringBitmap = groups.keys().filter_map(|values| values.get(pos).copied()).collect();
        let mut out = HashMap::new();
        index.meta.collect_tag_values(*tag_key_id, &ids, &mut out)?;
        names.push(out);
    }

    println!("{} groups", groups.len());
    for (values, members) in &groups {
        let label: Vec<String> = values
            .iter()
            .zip(group_by)
            .zip(&names)
            .map(|((value_id, key), resolved)| {
                let value = resolved.get(value_id).map(String::as_str).unwrap_or("?");
                format!("{}={}", key, value)
            })
            .collect();
        println!("{:<40} {} series", label.join(","), members.len());
    }
    Ok(())
}

fn parse_time(input: &str) -> anyhow::Result<i64> {
    if input == "now" {
        return Ok(Utc::now().timestamp_millis());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }
    input
        .parse::<i64>()
        .with_context(|| format!("Invalid timestamp: {}", input))
}

fn parse_pairs(items: &[String], separator: char) -> anyhow::Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| match item.split_once(separator) {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => bail!("Expected key{}value, got {:?}", separator, item),
        })
        .collect()
}

/// Order-independent hash of a tag set
fn hash_tags(tags: &[(String, String)]) -> u64 {
    let mut sorted: Vec<&(String, String)> = tags.iter().collect();
    sorted.sort();
    let mut hasher = crc32fast::Hasher::new();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b",");
    }
    hasher.finalize() as u64
}

fn display_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        tsindex::index::DEFAULT_NAMESPACE
    } else {
        namespace
    }
}
