//! Download one magnet through a local aria2 daemon.
//!
//! ```sh
//! RUST_LOG=gosh_aria2=debug,aria2=debug cargo run --example magnet_download -- "magnet:?xt=..." ./downloads
//! ```

use gosh_aria2::{DownloadEngine, EngineConfig, Progress, SubmitOptions, TaskListener};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct PrintProgress;

impl TaskListener for PrintProgress {
    fn on_metadata_progress(&self, p: Progress) {
        println!("metadata: {} connections", p.connections);
    }

    fn on_metadata_complete(&self, _p: Progress) {
        println!("metadata resolved");
    }

    fn on_progress(&self, p: Progress) {
        println!(
            "{:.1}% ({} / {} bytes, {} B/s)",
            p.percentage(),
            p.completed_bytes,
            p.total_bytes,
            p.speed
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let magnet = args.next().ok_or("usage: magnet_download <magnet> [dir]")?;
    let dir = args.next().unwrap_or_else(|| "./downloads".to_string());

    let mut config = EngineConfig::default().download_dir(&dir);
    config.daemon.debug.pipe = true;
    let engine = DownloadEngine::new(config)?;

    let options = SubmitOptions::new().listener(Arc::new(PrintProgress));
    let result = tokio::select! {
        result = engine.download("demo", &magnet, options) => result,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel("demo").await?;
            println!("canceled");
            engine.close().await;
            return Ok(());
        }
    };

    match result {
        Ok(downloaded) => {
            for file in &downloaded.files {
                println!("{}", file.display());
            }
        }
        Err(e) => eprintln!("download failed: {}", e),
    }

    if !engine.close().await {
        eprintln!("aria2 did not confirm shutdown");
    }
    Ok(())
}
