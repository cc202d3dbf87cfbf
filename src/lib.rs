//! `weft` is a runtime that schedules compute kernels over heterogeneous
//! devices. Callers declare how each kernel touches each buffer; the runtime
//! infers the dependency graph, keeps per-device copies coherent with
//! migration copies inserted only when needed, and executes independent
//! operations concurrently while each buffer observes its submission order.
//!
//! A [`Runtime`] is built explicitly from backend devices and torn down
//! explicitly; there is no global state. The bundled [`Cpu`] backend serves as
//! both the host and a stand-in accelerator.

pub mod access;
pub mod buffer;
pub mod device;
pub mod graph;
pub mod mptr;
pub mod platform;
pub mod runtime;
pub mod sched;

pub use access::{AccessMode, Accessor, DevicePolicy};
pub use buffer::{Buffer, BufferError, BufferId, CoherenceState};
pub use device::{
    CompletionToken, Cpu, CpuBuilder, Device, DeviceError, DeviceId, DeviceLoc, Kernel, KernelCtx,
};
pub use graph::{GraphError, Mermaid, MigrationInfo, NodeId, NodeStatus, OperationHandle};
pub use mptr::{AddressSpace, ConversionError, Decoration, MultiPtr};
pub use runtime::{
    Runtime, RuntimeBuilder, RuntimeError, stdpar_consume_sync, stdpar_optimizable_sync,
};
pub use sched::WaitScope;
