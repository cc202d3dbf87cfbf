//! Platform-dependent task spawning. Device loops, the scheduler, and copy
//! tasks run detached; they end when their channels disconnect, so the handle
//! is never kept.

use std::future::Future;

#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    drop(tokio::spawn(future));
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}
