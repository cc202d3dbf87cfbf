//! The user-facing runtime context.
//!
//! A [`Runtime`] is explicitly constructed, owns its devices and scheduler,
//! and is passed to everything that needs them; there is no ambient global
//! state. Kernels are submitted with declared accessors; the runtime infers
//! hazard edges, migrates data only when necessary, and runs independent
//! operations concurrently, while the submitting thread observes sequential
//! consistency per buffer.

use std::{sync::Arc, time::Duration};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    access::{AccessMode, Accessor},
    buffer::{Buffer, BufferId},
    device::{
        CpuBuilder, Device, DeviceError, DeviceEvent, DeviceLoc, Kernel, completion_pair,
    },
    graph::{self, GraphError, Mermaid, OperationHandle, Submission},
    mptr::ConversionError,
    platform,
    sched::{Scheduler, SchedulerEvent, WaitScope, serve},
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid buffer handle: {0}")]
    InvalidHandle(BufferId),
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceLoc),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("backend error on {loc}: {source}")]
    Backend {
        loc: DeviceLoc,
        source: DeviceError,
    },
    #[error("synchronization timed out after {0:?}")]
    Timeout(Duration),
    #[error("runtime channel closed")]
    Closed,
}

struct RuntimeInner {
    devices: HashMap<DeviceLoc, Arc<dyn Device>>,
    /// Registration order; the host comes first.
    locs: Vec<DeviceLoc>,
    sender: flume::Sender<SchedulerEvent>,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Default)]
pub struct RuntimeBuilder {
    devices: Vec<Arc<dyn Device>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: impl Device + 'static) -> Self {
        self.devices.push(Arc::new(device));
        self
    }

    /// Spawns the device loops and the scheduler. Must be called within an
    /// async runtime.
    pub fn build(self) -> Runtime {
        let host = CpuBuilder::new().build();

        let mut devices: HashMap<DeviceLoc, Arc<dyn Device>> = HashMap::default();
        let mut locs = vec![DeviceLoc::Host];
        devices.insert(DeviceLoc::Host, Arc::new(host));
        for device in self.devices {
            let loc = DeviceLoc::Device(device.id());
            locs.push(loc);
            devices.insert(loc, device);
        }

        let (sender, receiver) = flume::unbounded();
        let scheduler = Scheduler::new(devices.clone(), sender.clone());
        platform::spawn(serve(scheduler, receiver));

        let inner = RuntimeInner {
            devices,
            locs,
            sender,
        };
        Runtime {
            inner: Arc::new(inner),
        }
    }
}

impl Runtime {
    /// Registered device locations, the host first.
    #[inline]
    pub fn devices(&self) -> &[DeviceLoc] {
        &self.inner.locs
    }

    fn device(&self, loc: DeviceLoc) -> Result<&Arc<dyn Device>, RuntimeError> {
        self.inner
            .devices
            .get(&loc)
            .ok_or(RuntimeError::UnknownDevice(loc))
    }

    fn send(&self, event: SchedulerEvent) -> Result<(), RuntimeError> {
        self.inner
            .sender
            .send(event)
            .map_err(|_| RuntimeError::Closed)
    }

    /// Declares a zero-initialized buffer of `extent` elements of `elem_size`
    /// bytes each. The host holds the authoritative copy.
    pub async fn declare_buffer(
        &self,
        extent: usize,
        elem_size: usize,
    ) -> Result<Buffer, RuntimeError> {
        let buffer = Buffer::new(extent, elem_size);
        let (handle, token) = completion_pair();
        self.device(DeviceLoc::Host)?.execute(DeviceEvent::Alloc {
            id: buffer.id(),
            size: buffer.data_size(),
            handle,
        });
        token.wait().await.map_err(|source| RuntimeError::Backend {
            loc: DeviceLoc::Host,
            source,
        })?;
        Ok(buffer)
    }

    /// Declares a buffer initialized from host contents.
    pub async fn declare_buffer_init<T: bytemuck::Pod>(
        &self,
        contents: &[T],
    ) -> Result<Buffer, RuntimeError> {
        let buffer = Buffer::new(contents.len(), size_of::<T>());
        let (handle, token) = completion_pair();
        self.device(DeviceLoc::Host)?.execute(DeviceEvent::Upload {
            id: buffer.id(),
            data: bytemuck::cast_slice(contents).into(),
            handle,
        });
        token.wait().await.map_err(|source| RuntimeError::Backend {
            loc: DeviceLoc::Host,
            source,
        })?;
        Ok(buffer)
    }

    /// Declares an intent to access `buffer` with `mode` from `device`
    /// during one operation.
    pub fn access(
        &self,
        buffer: &Buffer,
        mode: AccessMode,
        device: DeviceLoc,
    ) -> Result<Accessor, RuntimeError> {
        self.device(device)?;
        if buffer.is_finalized() {
            return Err(RuntimeError::InvalidHandle(buffer.id()));
        }
        Ok(Accessor::new(buffer.clone(), mode, device))
    }

    /// Submits a kernel with its declared accessors. Returns once the node
    /// and any synthesized migrations are inserted into the graph; execution
    /// proceeds asynchronously.
    pub fn submit(
        &self,
        device: DeviceLoc,
        kernel: Kernel,
        accessors: Vec<Accessor>,
    ) -> Result<OperationHandle, RuntimeError> {
        self.device(device)?;
        for accessor in &accessors {
            if accessor.buffer().is_finalized() {
                return Err(RuntimeError::InvalidHandle(accessor.buffer().id()));
            }
        }
        let Submission { nodes, handle } = graph::plan_kernel(kernel, device, accessors)?;
        self.send(SchedulerEvent::Submit { nodes })?;
        Ok(handle)
    }

    async fn wait_scope(&self, scope: WaitScope) -> Result<(), RuntimeError> {
        let (sender, receiver) = flume::bounded(1);
        self.send(SchedulerEvent::Wait { scope, sender })?;
        receiver.recv_async().await.map_err(|_| RuntimeError::Closed)?
    }

    /// Drains the whole graph; raises the first recorded failure, if any.
    pub async fn wait(&self) -> Result<(), RuntimeError> {
        self.wait_scope(WaitScope::All).await
    }

    /// Drains the operations touching one buffer.
    pub async fn wait_buffer(&self, buffer: &Buffer) -> Result<(), RuntimeError> {
        self.wait_scope(WaitScope::Buffer(buffer.id())).await
    }

    /// Drains one device's queue.
    pub async fn wait_device(&self, device: DeviceLoc) -> Result<(), RuntimeError> {
        self.wait_scope(WaitScope::Device(device)).await
    }

    /// A bounded variant of [`wait`](Self::wait). Expiry leaves the graph
    /// undisturbed.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<(), RuntimeError> {
        match tokio::time::timeout(duration, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(duration)),
        }
    }

    /// Reads back the buffer's contents as the host observes them after all
    /// pending operations, migrating to the host if its copy is stale.
    pub async fn read_back<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
    ) -> Result<Vec<T>, RuntimeError> {
        let accessor = self.access(buffer, AccessMode::ReadOnly, DeviceLoc::Host)?;
        let (sender, receiver) = flume::bounded(1);
        let callback = Box::new(move || {
            _ = sender.send(());
        });
        let Submission { nodes, .. } =
            graph::plan_callback(callback, DeviceLoc::Host, vec![accessor])?;
        self.send(SchedulerEvent::Submit { nodes })?;

        if receiver.recv_async().await.is_err() {
            // the callback was poisoned; surface the recorded failure
            self.wait_buffer(buffer).await?;
            return Err(RuntimeError::Closed);
        }

        let (sender, receiver) = flume::bounded(1);
        self.device(DeviceLoc::Host)?.execute(DeviceEvent::Download {
            id: buffer.id(),
            sender,
        });
        let data = receiver
            .recv_async()
            .await
            .map_err(|_| RuntimeError::Closed)?
            .map_err(|source| RuntimeError::Backend {
                loc: DeviceLoc::Host,
                source,
            })?;
        Ok(bytemuck::cast_slice(&data[..]).to_vec())
    }

    /// Destroys a buffer: drains every operation touching it, then releases
    /// its device memory. Teardown is a first-class operation; no memory is
    /// freed while any node referencing the buffer is in flight.
    pub async fn destroy_buffer(&self, buffer: Buffer) -> Result<(), RuntimeError> {
        buffer.finalize();
        let (sender, receiver) = flume::bounded(1);
        self.send(SchedulerEvent::Destroy { buffer, sender })?;
        receiver.recv_async().await.map_err(|_| RuntimeError::Closed)?
    }

    /// Renders the live execution graph.
    pub async fn mermaid(&self) -> Result<Mermaid, RuntimeError> {
        let (sender, receiver) = flume::bounded(1);
        self.send(SchedulerEvent::Mermaid { sender })?;
        receiver.recv_async().await.map_err(|_| RuntimeError::Closed)
    }
}

/// Synchronization barrier hook invoked by generated standard-parallelism
/// glue. Kept out of line so an optimizer can recognize the call site and
/// elide barriers proven to have no observable effect.
#[inline(never)]
pub async fn stdpar_optimizable_sync(runtime: &Runtime) -> Result<(), RuntimeError> {
    runtime.wait().await
}

/// Anchors an optimizer decision about whether a barrier is required. A
/// runtime no-op with no data effect; never treated as a scheduling
/// dependency.
#[inline(always)]
pub fn stdpar_consume_sync() {}
