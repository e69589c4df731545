//! Get command - retrieve verified content

use crate::cli::args::GetArgs;
use crate::cli::{parse_hash, CacheHandle};
use crate::config::Config;
use crate::error::{VstoreError, VstoreResult};
use console::style;
use std::io::Write;
use tokio::fs;

/// Execute the get command
pub async fn execute(args: GetArgs, config: &Config) -> VstoreResult<()> {
    let hash = parse_hash(&args.hash)?;

    let cache = CacheHandle::open(config).await?;
    let session = cache.session();
    let result = session.get_content(hash).await;
    cache.finish(session).await?;

    let bytes = result?.ok_or(VstoreError::ContentNotFound(hash))?;

    match args.output {
        Some(path) => {
            fs::write(&path, &bytes)
                .await
                .map_err(|e| VstoreError::io(format!("writing {}", path.display()), e))?;
            eprintln!(
                "{} Wrote {} bytes to {}",
                style("✓").green(),
                bytes.len(),
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&bytes)
                .and_then(|()| stdout.flush())
                .map_err(|e| VstoreError::io("writing content to stdout", e))?;
        }
    }

    Ok(())
}
