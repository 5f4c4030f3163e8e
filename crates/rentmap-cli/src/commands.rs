//! Subcommand implementations

use crate::settings::QueryArgs;
use anyhow::Context;
use geo::{BoundingRect, MultiPoint, Point};
use rentmap_geo::protocol::{IndexSpec, QueryData};
use rentmap_geo::{BoundingBox, IndexWorker, IndexedEntity, WorkerState};
use serde_json::json;
use std::io::{BufRead, Write};

/// Smallest box covering every listing, or `None` for an empty set
fn extent(entities: &[IndexedEntity]) -> Option<BoundingBox> {
    let points: MultiPoint<f64> = entities
        .iter()
        .filter(|e| e.position().is_finite())
        .map(|e| Point::from(e.position()))
        .collect();
    points.bounding_rect().map(BoundingBox::from)
}

pub async fn query(args: &QueryArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.listings)
        .with_context(|| format!("reading {}", args.listings.display()))?;
    let entities: Vec<IndexedEntity> = serde_json::from_str(&text)
        .with_context(|| format!("decoding listings from {}", args.listings.display()))?;

    let bounds = match args.bounds {
        Some(bounds) => bounds,
        None => extent(&entities).context("listings file has no usable coordinates")?,
    };
    let submitted = entities.len();

    let worker = IndexWorker::spawn(args.worker_config()?)?;
    let handle = worker.handle().clone();

    let spec = IndexSpec::new(bounds, entities.into(), args.index_config()).with_version("cli");
    let indexed = handle
        .build_index(spec.clone())
        .await
        .context("building index")?;
    tracing::info!(submitted, indexed, "Index built");

    let visible = handle
        .query(QueryData::in_box(spec.clone(), args.viewport))
        .await
        .context("viewport query")?;

    let near = match (args.near, args.radius_km) {
        (Some(center), Some(radius_km)) => Some(
            handle
                .query(QueryData::in_radius(spec, center, radius_km))
                .await
                .context("radius query")?,
        ),
        _ => None,
    };

    let output = json!({
        "bounds": bounds,
        "indexed": indexed,
        "visible": visible,
        "near": near,
    });
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");

    drop(handle);
    worker.shutdown().await?;
    Ok(())
}

/// Answer one JSON request per input line with one JSON response per output line
pub fn serve(input: impl BufRead, mut output: impl Write) -> anyhow::Result<()> {
    let mut state = WorkerState::new();
    let mut handled = 0u64;

    for line in input.lines() {
        let line = line.context("reading request")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = state.handle_json(&line);
        writeln!(output, "{reply}").context("writing response")?;
        output.flush()?;
        handled += 1;
    }

    tracing::info!(handled, "Input closed, stopping");
    Ok(())
}
