use std::env;
use std::sync::Arc;

use binlog_relay::checkpoint::{CheckpointMarker, CheckpointStore, S3CheckpointBackend};
use binlog_relay::config::DEFAULT_CHECKPOINT_KEY;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let region = env::var("AWS_REGION")?;
    let bucket = env::var("CHECKPOINT_BUCKET")?;
    let key = env::var("CHECKPOINT_KEY").unwrap_or_else(|_| DEFAULT_CHECKPOINT_KEY.to_string());

    let backend = S3CheckpointBackend::from_env(&region, bucket).await;
    let store = CheckpointStore::new(Arc::new(backend), key);

    match args[1].as_str() {
        "show" if args.len() == 2 => {
            let marker = store.read().await?;
            println!("{}", serde_json::to_string_pretty(&marker)?);
        }
        "set" if args.len() == 4 => {
            let pos: u64 = args[3].parse()?;
            let marker = CheckpointMarker::at(args[2].clone(), pos);
            store.init(marker.clone()).await?;
            println!("Checkpoint {} written to {}", marker, store.key());
        }
        _ => {
            usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage() {
    eprintln!("Usage:");
    eprintln!("  relay-checkpoint show");
    eprintln!("  relay-checkpoint set <log_file> <log_pos>");
    eprintln!();
    eprintln!("Reads AWS_REGION, CHECKPOINT_BUCKET and CHECKPOINT_KEY from the environment.");
}
