//! Bridge between the synchronous core and the async execution model.
//!
//! The synchronous implementations are the single source of truth; every
//! async twin runs the synchronous body on the blocking pool through this
//! helper. A panic inside the closure (e.g. a panicking transform) resumes on
//! the awaiting caller, matching what the synchronous call would do.

/// Runs a blocking closure on the tokio blocking pool and awaits its result.
pub async fn run_blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task cancelled: {err}"),
    }
}
