//! Pin command - make content available in the local tier

use crate::cli::args::PinArgs;
use crate::cli::{parse_hash, CacheHandle};
use crate::config::Config;
use crate::error::{VstoreError, VstoreResult};
use crate::store::PinOutcome;
use console::{style, Emoji};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[MISS] ");

/// Execute the pin command
pub async fn execute(args: PinArgs, config: &Config) -> VstoreResult<()> {
    let hashes = args
        .hashes
        .iter()
        .map(|h| parse_hash(h))
        .collect::<VstoreResult<Vec<_>>>()?;

    let cache = CacheHandle::open(config).await?;
    let session = cache.session();

    let mut missing = None;
    let mut failure = None;
    for hash in hashes {
        match session.pin_to_cas(hash).await {
            Ok(PinOutcome::Pinned) => println!("{}{}", CHECK, hash),
            Ok(PinOutcome::NotFound) => {
                println!("{}{} {}", CROSS, hash, style("not found").red());
                missing.get_or_insert(hash);
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    cache.finish(session).await?;

    if let Some(e) = failure {
        return Err(e);
    }
    match missing {
        Some(hash) => Err(VstoreError::ContentNotFound(hash)),
        None => Ok(()),
    }
}
