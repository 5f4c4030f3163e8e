use clap::{Args, Parser, Subcommand};
use rentmap_geo::{BoundingBox, GeoPoint, IndexConfig, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Rentmap - headless driver for the listing index and its worker protocol
pub struct Settings {
    #[clap(subcommand)]
    pub command: Command,

    /// Record a Chrome trace to this file (requires the `profiling` feature)
    #[clap(long, global = true, value_name = "FILE")]
    pub trace_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build an index from a listings file and run one viewport query
    Query(QueryArgs),

    /// Answer worker protocol requests from stdin, one JSON document per line
    Serve,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// JSON array of `{id, lat, lng, payload}` listings
    #[clap(short, long, value_name = "FILE")]
    pub listings: PathBuf,

    /// Index coverage as `min_lat,max_lat,min_lng,max_lng` (default: extent of the listings)
    #[clap(long, value_parser = parse_bounds, allow_hyphen_values = true)]
    pub bounds: Option<BoundingBox>,

    /// Viewport to query as `min_lat,max_lat,min_lng,max_lng`
    #[clap(long, value_parser = parse_bounds, allow_hyphen_values = true)]
    pub viewport: BoundingBox,

    /// Also report listings within `--radius-km` of this `lat,lng`
    #[clap(long, value_parser = parse_point, allow_hyphen_values = true, requires = "radius_km")]
    pub near: Option<GeoPoint>,

    /// Radius for `--near`, in kilometers
    #[clap(long, requires = "near")]
    pub radius_km: Option<f64>,

    /// Maximum listings per quadtree node before subdivision
    #[clap(long, default_value = "8")]
    pub max_items_per_node: usize,

    /// Maximum quadtree depth (root = 0)
    #[clap(long, default_value = "8")]
    pub max_depth: u32,

    /// Worker request deadline in seconds
    #[clap(long, default_value = "5.0")]
    pub timeout_secs: f64,

    /// Pretty-print the JSON output
    #[clap(long, default_value = "false")]
    pub pretty: bool,
}

impl QueryArgs {
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig::new(self.max_items_per_node, self.max_depth)
    }

    pub fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let request_timeout = Duration::try_from_secs_f64(self.timeout_secs)
            .map_err(|e| anyhow::anyhow!("invalid --timeout-secs {}: {e}", self.timeout_secs))?;
        Ok(WorkerConfig {
            request_timeout,
            ..WorkerConfig::default()
        })
    }
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[f64; N], String> {
    let values = s
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|e| format!("{part:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    values
        .try_into()
        .map_err(|v: Vec<f64>| format!("expected {N} comma-separated numbers, got {}", v.len()))
}

fn parse_bounds(s: &str) -> Result<BoundingBox, String> {
    let [min_lat, max_lat, min_lng, max_lng] = parse_numbers::<4>(s)?;
    BoundingBox::try_new(min_lat, max_lat, min_lng, max_lng).map_err(|e| e.to_string())
}

fn parse_point(s: &str) -> Result<GeoPoint, String> {
    let [lat, lng] = parse_numbers::<2>(s)?;
    let point = GeoPoint::new(lat, lng);
    if !point.is_finite() {
        return Err(format!("non-finite coordinate {s:?}"));
    }
    Ok(point)
}
