//! The `kiln precompile` subcommand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use kiln_cache::ChangeCache;
use kiln_common::mime;
use kiln_host::{CompilerHost, HostError, PassthroughTransform, Transform, TransformRegistry};
use tracing::{info, warn};

/// Arguments for the `kiln precompile` subcommand.
#[derive(Parser, Debug)]
pub struct PrecompileArgs {
    /// Application root directory.
    #[arg(long, default_value = ".")]
    pub app_root: PathBuf,

    /// Directory to walk; defaults to the app root.
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Cache directory; defaults to `<app-root>/.kiln-cache`.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

/// Compiles every eligible file and saves the configuration snapshot.
///
/// Returns the process exit code: nonzero when any file failed, so a
/// packaging pipeline notices an incomplete cache.
pub fn run(args: &PrecompileArgs) -> Result<i32, HostError> {
    let app_root = &args.app_root;
    let cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(|| app_root.join(".kiln-cache"));
    let source_dir = args.source_dir.clone().unwrap_or_else(|| app_root.clone());

    let change_cache = Arc::new(ChangeCache::new(Some(app_root)));
    let passthrough: Arc<dyn Transform> = Arc::new(PassthroughTransform);
    let mut registry = TransformRegistry::new();
    registry.insert(
        mime::PASSTHROUGH_MIME_TYPE.to_string(),
        Arc::clone(&passthrough),
    );

    let host = CompilerHost::new(
        cache_dir,
        registry,
        change_cache,
        false,
        Some(passthrough),
    )?;

    let failures = host.compile_all(&source_dir, |path| {
        !is_hidden(path.strip_prefix(&source_dir).unwrap_or(path))
    })?;
    host.save_configuration()?;

    for failure in &failures {
        warn!(path = %failure.path.display(), error = %failure.error, "not precompiled");
    }
    info!(
        tracked = host.change_cache().len(),
        failures = failures.len(),
        "precompile finished"
    );

    Ok(if failures.is_empty() { 0 } else { 1 })
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| name.starts_with('.') && name != "." && name != "..")
    })
}
