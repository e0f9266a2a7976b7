//! Small diagnostic CLI: load the manifest at `RDRR_MODEL_PATH` against
//! a local shard store and print what the loader resolved, without
//! standing up a full inference stack. Mirrors the teacher's
//! `load_default_model()` / `INFERENCE_MODEL_ID` env-driven bootstrap
//! (`continuum-core/src/inference/backends/mod.rs`).

use std::sync::Arc;

use rdrr_loader::{DeviceRequest, LoadOptions, Loader, LocalShardStore, Manifest};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let model_path = std::env::var("RDRR_MODEL_PATH")
        .map_err(|_| "set RDRR_MODEL_PATH to a directory containing manifest.json and shard files")?;

    let manifest_path = std::path::Path::new(&model_path).join("manifest.json");
    let manifest_json = tokio::fs::read_to_string(&manifest_path).await?;
    let manifest = Manifest::parse(&manifest_json)?;

    let filenames: Vec<String> = manifest.shards.iter().map(|s| s.filename.clone()).collect();
    let source = Arc::new(LocalShardStore::new(&model_path, filenames));

    let mut loader = Loader::init(DeviceRequest::Auto)?;
    loader.set_shard_source(source, true);
    loader.set_manifest(manifest);

    let on_progress = |event: rdrr_loader::ProgressEvent| {
        println!("{:?} {:.0}%", event.stage, event.fraction * 100.0);
    };
    let config = loader
        .load(&model_path, LoadOptions { verify_hashes: true, on_progress: Some(&on_progress) })
        .await?;

    println!("loaded model config: {config}");
    let stats = loader.stats();
    println!(
        "live_buffers={} bytes_acquired={} cached_shards={}",
        stats.live_buffers, stats.bytes_acquired, stats.cached_shards
    );

    Ok(())
}
