//! Uniform operations over a concrete accelerator.
//!
//! A [`Device`] is a handle to a command queue served by a spawned task;
//! the scheduler talks to it exclusively through [`DeviceEvent`] messages.
//! Completion is observed through [`CompletionToken`]s, by polling or by
//! awaiting. Backends that support native cross-queue ordering accept
//! predecessor tokens with a launch and enforce ordering on their own queue,
//! keeping the host out of the critical path.

use std::{
    borrow::Cow,
    sync::{Arc, OnceLock},
};

use derive_more::{Deref, Display};
use thiserror::Error;

use crate::{access::AccessMode, buffer::BufferId};

pub use cpu::{Cpu, CpuBuilder};

pub mod cpu;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct DeviceId(uid::Id<DeviceId>);

impl DeviceId {
    pub(crate) fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Where a copy of a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceLoc {
    #[display("host")]
    Host,
    #[display("device:{_0}")]
    Device(DeviceId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("allocation of {size} bytes failed")]
    Alloc { size: usize },
    #[error("kernel launch failed: {0}")]
    Launch(String),
    #[error("kernel execution failed: {0}")]
    Execution(String),
    #[error("kernel binding error: {0}")]
    Binding(String),
    #[error("buffer {0} is not resident on the device")]
    Missing(BufferId),
    #[error("predecessor operation failed")]
    Dependency,
    #[error("device channel closed")]
    Closed,
}

/// An opaque callable already lowered to device-executable form. The runtime
/// never inspects kernel bodies; it only schedules them by their declared
/// accessors.
#[derive(Clone)]
pub struct Kernel {
    name: Cow<'static, str>,
    f: Arc<dyn Fn(&mut KernelCtx) -> Result<(), DeviceError> + Send + Sync>,
}

impl Kernel {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(&mut KernelCtx) -> Result<(), DeviceError> + Send + Sync + 'static,
    {
        let name = name.into();
        let f = Arc::new(f);
        Self { name, f }
    }

    #[inline]
    pub fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    #[inline]
    pub(crate) fn call(&self, ctx: &mut KernelCtx) -> Result<(), DeviceError> {
        (self.f)(ctx)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Kernel").field(&self.name).finish()
    }
}

/// One bound argument of a kernel launch, in accessor declaration order.
/// Scratch bindings are transient per-launch slabs that never persist on the
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub id: BufferId,
    pub size: usize,
    pub access: AccessMode,
    pub scratch: bool,
}

impl Binding {
    #[inline]
    pub fn writable(&self) -> bool {
        !matches!(self.access, AccessMode::ReadOnly)
    }
}

pub enum KernelArg<'a> {
    Read(&'a [u8]),
    Write(&'a mut [u8]),
}

/// Views of the bound buffers' device-local bytes, handed to the kernel body.
/// Arguments are indexed in accessor declaration order.
pub struct KernelCtx<'a> {
    args: Vec<KernelArg<'a>>,
}

impl<'a> KernelCtx<'a> {
    pub(crate) fn new(args: Vec<KernelArg<'a>>) -> Self {
        Self { args }
    }

    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn read<T: bytemuck::Pod>(&self, index: usize) -> Result<&[T], DeviceError> {
        let arg = self
            .args
            .get(index)
            .ok_or_else(|| DeviceError::Binding(format!("no argument at index {index}")))?;
        let bytes = match arg {
            KernelArg::Read(bytes) => *bytes,
            KernelArg::Write(bytes) => &**bytes,
        };
        bytemuck::try_cast_slice(bytes).map_err(|err| DeviceError::Binding(err.to_string()))
    }

    pub fn write<T: bytemuck::Pod>(&mut self, index: usize) -> Result<&mut [T], DeviceError> {
        let arg = self
            .args
            .get_mut(index)
            .ok_or_else(|| DeviceError::Binding(format!("no argument at index {index}")))?;
        let bytes = match arg {
            KernelArg::Write(bytes) => &mut **bytes,
            KernelArg::Read(_) => {
                return Err(DeviceError::Binding(format!(
                    "argument {index} is bound read-only"
                )));
            }
        };
        bytemuck::try_cast_slice_mut(bytes).map_err(|err| DeviceError::Binding(err.to_string()))
    }
}

/// Commands a device queue serves, in submission order.
pub enum DeviceEvent {
    Alloc {
        id: BufferId,
        size: usize,
        handle: CompletionHandle,
    },
    Free {
        id: BufferId,
    },
    Upload {
        id: BufferId,
        data: Arc<[u8]>,
        handle: CompletionHandle,
    },
    Download {
        id: BufferId,
        sender: flume::Sender<Result<Arc<[u8]>, DeviceError>>,
    },
    Launch {
        kernel: Kernel,
        bindings: Vec<Binding>,
        /// Predecessor tokens the queue awaits before launching. Only
        /// populated for backends with native cross-queue ordering.
        after: Vec<CompletionToken>,
        handle: CompletionHandle,
    },
}

pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;
    /// Enqueues a command. Never blocks on device completion.
    fn execute(&self, event: DeviceEvent);
    /// Whether the queue can await predecessor tokens on its own, so the
    /// hardware rather than the host enforces cross-queue ordering.
    fn native_ordering(&self) -> bool;
}

type TokenState = Arc<OnceLock<Result<(), DeviceError>>>;

/// Signals completion of one enqueued command. Consumed exactly once; dropping
/// it without completing reports the queue as closed.
pub struct CompletionHandle {
    state: TokenState,
    _signal: flume::Sender<()>,
}

impl CompletionHandle {
    pub fn complete(self, result: Result<(), DeviceError>) {
        let _ = self.state.set(result);
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle").finish_non_exhaustive()
    }
}

/// Backend-provided handle observing when a command has finished. Immutable
/// once created; cloneable across queues and tasks.
#[derive(Clone)]
pub struct CompletionToken {
    state: TokenState,
    signal: flume::Receiver<()>,
}

impl CompletionToken {
    /// Queries completion without blocking.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state.get().is_some()
    }

    /// Blocks until the command completes, surfacing its result.
    pub async fn wait(&self) -> Result<(), DeviceError> {
        // the channel disconnects once the handle records a result
        let _ = self.signal.recv_async().await;
        match self.state.get() {
            Some(result) => result.clone(),
            None => Err(DeviceError::Closed),
        }
    }
}

impl std::fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionToken")
            .field("complete", &self.is_complete())
            .finish()
    }
}

pub fn completion_pair() -> (CompletionHandle, CompletionToken) {
    let state: TokenState = Default::default();
    let (sender, receiver) = flume::bounded(0);
    let handle = CompletionHandle {
        state: state.clone(),
        _signal: sender,
    };
    let token = CompletionToken {
        state,
        signal: receiver,
    };
    (handle, token)
}

#[cfg(test)]
mod tests {
    use super::{DeviceError, completion_pair};

    #[tokio::test]
    async fn test_completion_token() {
        let (handle, token) = completion_pair();
        assert!(!token.is_complete());

        let other = token.clone();
        handle.complete(Ok(()));

        assert!(token.is_complete());
        assert_eq!(token.wait().await, Ok(()));
        assert_eq!(other.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_handle() {
        let (handle, token) = completion_pair();
        drop(handle);
        assert_eq!(token.wait().await, Err(DeviceError::Closed));
    }
}
