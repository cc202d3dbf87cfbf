use derive_more::Display;
use futures::future::join_all;
use rustc_hash::FxHashMap as HashMap;

use super::{
    Binding, CompletionToken, Device, DeviceError, DeviceEvent, DeviceId, Kernel, KernelArg,
    KernelCtx,
};
use crate::{buffer::BufferId, platform};

/// Memory pool and execution state behind one command queue. Kernels execute
/// over process memory; the pool stands in for device-resident storage until
/// a driver-backed plugin takes its place.
#[derive(Debug, Default)]
pub struct Backend {
    /// Device-resident copies of buffers.
    pool: HashMap<BufferId, Vec<u8>>,
    /// Bytes the pool may hold; `None` is unbounded.
    capacity: Option<usize>,
    used: usize,
}

impl Backend {
    fn reserve(&mut self, size: usize) -> Result<(), DeviceError> {
        match self.capacity {
            Some(capacity) if self.used + size > capacity => Err(DeviceError::Alloc { size }),
            _ => {
                self.used += size;
                Ok(())
            }
        }
    }

    pub fn alloc(&mut self, id: BufferId, size: usize) -> Result<(), DeviceError> {
        if let Some(slab) = self.pool.get(&id) {
            if slab.len() == size {
                return Ok(());
            }
            self.free(id);
        }
        self.reserve(size)?;
        self.pool.insert(id, vec![0; size]);
        Ok(())
    }

    pub fn free(&mut self, id: BufferId) {
        if let Some(slab) = self.pool.remove(&id) {
            self.used -= slab.len();
        }
    }

    pub fn upload(&mut self, id: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        self.alloc(id, data.len())?;
        match self.pool.get_mut(&id) {
            Some(slab) => {
                slab.copy_from_slice(data);
                Ok(())
            }
            None => Err(DeviceError::Missing(id)),
        }
    }

    pub fn download(&self, id: BufferId) -> Result<std::sync::Arc<[u8]>, DeviceError> {
        self.pool
            .get(&id)
            .map(|slab| slab.as_slice().into())
            .ok_or(DeviceError::Missing(id))
    }

    pub fn launch(&mut self, kernel: &Kernel, bindings: &[Binding]) -> Result<(), DeviceError> {
        // detach writable slabs; writable binding ids are unique per launch
        let mut slots: Vec<Option<Vec<u8>>> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let slot = match (binding.writable(), binding.scratch) {
                (false, false) => None,
                // scratch lives only for the duration of the launch
                (_, true) => Some(vec![0; binding.size]),
                (true, false) => match self.pool.remove(&binding.id) {
                    Some(slab) => {
                        self.used -= slab.len();
                        Some(slab)
                    }
                    // a discarding write allocates on first touch
                    None if matches!(binding.access, crate::access::AccessMode::WriteOnly) => {
                        self.reserve(binding.size)?;
                        self.used -= binding.size;
                        Some(vec![0; binding.size])
                    }
                    None => return Err(DeviceError::Missing(binding.id)),
                },
            };
            slots.push(slot);
        }

        let mut args = Vec::with_capacity(bindings.len());
        for (slot, binding) in slots.iter_mut().zip(bindings.iter()) {
            match slot {
                Some(slab) => args.push(KernelArg::Write(&mut slab[..])),
                None => {
                    let slab = self
                        .pool
                        .get(&binding.id)
                        .ok_or(DeviceError::Missing(binding.id))?;
                    args.push(KernelArg::Read(slab.as_slice()));
                }
            }
        }

        let mut ctx = KernelCtx::new(args);
        let result = kernel.call(&mut ctx);
        drop(ctx);

        // reattach written slabs whether or not the kernel succeeded; the
        // scheduler invalidates the copies of a failed writer
        for (slot, binding) in slots.into_iter().zip(bindings.iter()) {
            if binding.scratch {
                continue;
            }
            if let Some(slab) = slot {
                self.used += slab.len();
                self.pool.insert(binding.id, slab);
            }
        }
        result
    }
}

/// Handle to an in-process command queue. One instance is the host; further
/// instances stand in for discrete accelerators.
#[derive(Debug, Clone, Display)]
#[display("cpu:{id}")]
pub struct Cpu {
    /// The unique identifier of the device.
    id: DeviceId,
    native: bool,
    /// Sends commands to the serving task.
    sender: flume::Sender<DeviceEvent>,
}

impl Device for Cpu {
    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn execute(&self, event: DeviceEvent) {
        _ = self.sender.send(event)
    }

    #[inline]
    fn native_ordering(&self) -> bool {
        self.native
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    capacity: Option<usize>,
    native: bool,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the device memory pool, in bytes.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Lets the queue await predecessor tokens itself instead of relying on
    /// host-side ordering.
    pub fn native_ordering(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn build(self) -> Cpu {
        let backend = Backend {
            capacity: self.capacity,
            ..Default::default()
        };
        let (sender, receiver) = flume::unbounded();
        platform::spawn(serve(backend, receiver));

        let id = DeviceId::new();
        let native = self.native;
        Cpu { id, native, sender }
    }
}

async fn gate(after: Vec<CompletionToken>) -> Result<(), DeviceError> {
    let results = join_all(after.iter().map(CompletionToken::wait)).await;
    match results.into_iter().all(|result| result.is_ok()) {
        true => Ok(()),
        false => Err(DeviceError::Dependency),
    }
}

async fn serve(mut backend: Backend, receiver: flume::Receiver<DeviceEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Alloc { id, size, handle } => handle.complete(backend.alloc(id, size)),
            DeviceEvent::Free { id } => backend.free(id),
            DeviceEvent::Upload { id, data, handle } => handle.complete(backend.upload(id, &data)),
            DeviceEvent::Download { id, sender } => {
                _ = sender.send(backend.download(id));
            }
            DeviceEvent::Launch {
                kernel,
                bindings,
                after,
                handle,
            } => {
                let result = match gate(after).await {
                    Ok(()) => backend.launch(&kernel, &bindings),
                    Err(err) => Err(err),
                };
                if let Err(err) = &result {
                    log::error!("launch of kernel {} failed: {err}", kernel.name());
                }
                handle.complete(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Cpu, CpuBuilder};
    use crate::{
        access::AccessMode,
        buffer::BufferId,
        device::{Binding, Device, DeviceError, DeviceEvent, Kernel, completion_pair},
    };

    async fn upload(cpu: &Cpu, id: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        let (handle, token) = completion_pair();
        let data: Arc<[u8]> = data.into();
        cpu.execute(DeviceEvent::Upload { id, data, handle });
        token.wait().await
    }

    async fn download(cpu: &Cpu, id: BufferId) -> Result<Arc<[u8]>, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        cpu.execute(DeviceEvent::Download { id, sender });
        receiver.recv_async().await.map_err(|_| DeviceError::Closed)?
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let cpu = CpuBuilder::new().build();
        let id = BufferId::new();
        upload(&cpu, id, &[1, 2, 3, 4]).await.expect("upload");
        let data = download(&cpu, id).await.expect("download");
        assert_eq!(&data[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_capacity() {
        let cpu = CpuBuilder::new().capacity(2).build();
        let id = BufferId::new();
        let result = upload(&cpu, id, &[0; 16]).await;
        assert_eq!(result, Err(DeviceError::Alloc { size: 16 }));
    }

    #[tokio::test]
    async fn test_launch() {
        let cpu = CpuBuilder::new().build();
        let id = BufferId::new();
        upload(&cpu, id, bytemuck::cast_slice(&[1u32, 2, 3, 4]))
            .await
            .expect("upload");

        let kernel = Kernel::new("double", |ctx| {
            let data = ctx.write::<u32>(0)?;
            data.iter_mut().for_each(|x| *x *= 2);
            Ok(())
        });
        let bindings = vec![Binding {
            id,
            size: 16,
            access: AccessMode::ReadWrite,
            scratch: false,
        }];
        let (handle, token) = completion_pair();
        cpu.execute(DeviceEvent::Launch {
            kernel,
            bindings,
            after: vec![],
            handle,
        });
        token.wait().await.expect("launch");

        let data = download(&cpu, id).await.expect("download");
        assert_eq!(bytemuck::cast_slice::<_, u32>(&data), &[2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_native_gate() {
        let cpu = CpuBuilder::new().native_ordering(true).build();
        let id = BufferId::new();

        let kernel = Kernel::new("ones", |ctx| {
            ctx.write::<u32>(0)?.fill(1);
            Ok(())
        });
        let bindings = vec![Binding {
            id,
            size: 16,
            access: AccessMode::WriteOnly,
            scratch: false,
        }];

        // the queue must await the predecessor token before launching
        let (pred_handle, pred_token) = completion_pair();
        let (handle, token) = completion_pair();
        cpu.execute(DeviceEvent::Launch {
            kernel,
            bindings,
            after: vec![pred_token],
            handle,
        });

        assert!(!token.is_complete());
        pred_handle.complete(Ok(()));
        token.wait().await.expect("launch");

        let data = download(&cpu, id).await.expect("download");
        assert_eq!(bytemuck::cast_slice::<_, u32>(&data), &[1, 1, 1, 1]);
    }
}
