//! Shared repository plumbing.

use anyhow::anyhow;
use std::{future::Future, time::Duration};

/// Bound a repository call with a timeout. A timeout is reported as
/// provider-unavailable, the same as any other I/O failure; it never panics
/// or hangs the session worker.
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("repository call exceeded {timeout:?}")),
    }
}
