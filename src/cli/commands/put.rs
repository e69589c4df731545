//! Put command - store a file as content

use crate::cli::args::PutArgs;
use crate::cli::CacheHandle;
use crate::config::Config;
use crate::error::{VstoreError, VstoreResult};
use tokio::fs;

/// Execute the put command
pub async fn execute(args: PutArgs, config: &Config) -> VstoreResult<()> {
    let bytes = fs::read(&args.file)
        .await
        .map_err(|e| VstoreError::io(format!("reading {}", args.file.display()), e))?;

    let cache = CacheHandle::open(config).await?;
    let session = cache.session();
    let result = session.put(&bytes).await;
    cache.finish(session).await?;

    println!("{}", result?);
    Ok(())
}
