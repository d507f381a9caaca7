use std::future::Future;

use tokio::runtime::{Handle, RuntimeFlavor};

/// Drives `future` to completion from synchronous code, such as a FUSE
/// callback thread. Inside a multi-threaded runtime the current worker is
/// handed off first so the runtime keeps making progress.
pub fn poll_until_ready<Fut>(handle: &Handle, future: Fut) -> Fut::Output
where
    Fut: Future,
{
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        _ => handle.block_on(future),
    }
}
