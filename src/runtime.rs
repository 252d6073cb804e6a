use std::future::Future;

use once_cell::sync::OnceCell;
use tokio::runtime::{Handle, Runtime};

static TOKIO_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Initializes a global multi-threaded Tokio runtime if not already initialized.
/// Safe to call multiple times.
pub fn init_tokio_runtime() -> std::io::Result<&'static Runtime> {
    TOKIO_RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("flowbot-rt")
            .enable_all()
            .build()
    })
}

/// Runs a future to completion on the global runtime.
///
/// Must not be called from inside an async context.
pub fn run_blocking<F, R>(fut: F) -> std::io::Result<R>
where
    F: Future<Output = R>,
{
    let rt = init_tokio_runtime()?;
    Ok(rt.block_on(fut))
}

/// Gets a handle to the global runtime.
pub fn get_handle() -> std::io::Result<Handle> {
    Ok(init_tokio_runtime()?.handle().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_calls_share_one_runtime() {
        let a = run_blocking(async { tokio::spawn(async { 21 * 2 }).await.unwrap() }).unwrap();
        assert_eq!(a, 42);
        let first = init_tokio_runtime().unwrap() as *const Runtime;
        let second = init_tokio_runtime().unwrap() as *const Runtime;
        assert_eq!(first, second);
        assert!(get_handle().is_ok());
    }
}
