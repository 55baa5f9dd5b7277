//! The `kiln status` subcommand.

use std::path::PathBuf;

use clap::Parser;
use kiln_host::{HostError, SavedConfiguration};

/// Arguments for the `kiln status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Cache directory to inspect.
    #[arg(long, default_value = ".kiln-cache")]
    pub cache_dir: PathBuf,
}

/// Prints a summary of a saved cache configuration.
pub fn run(args: &StatusArgs) -> Result<i32, HostError> {
    let config = SavedConfiguration::read_from(&args.cache_dir)?;

    println!(
        "app root: {}",
        config
            .file_change_cache
            .app_root
            .as_deref()
            .unwrap_or("<none>")
    );
    println!(
        "tracked files: {}",
        config.file_change_cache.change_cache.len()
    );

    let mut entries: Vec<_> = config.compilers.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    println!("transforms:");
    for (mime_type, identity) in entries {
        println!(
            "  {mime_type} -> {} {} [{}]",
            identity.name,
            identity.version,
            identity.namespace_digest()
        );
    }

    Ok(0)
}
