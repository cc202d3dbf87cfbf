//! Declared read/write intents on buffers.
//!
//! An [`Accessor`] is produced at submission time and consumed by the graph
//! builder; it owns no memory, only a capability to touch its buffer from one
//! device during one operation.

use derive_more::Display;

use crate::{
    buffer::Buffer,
    device::{Binding, DeviceLoc},
    mptr::AddressSpace,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    /// Discards prior contents: the target device need not hold a valid copy.
    WriteOnly,
}

/// Whether the accessor's device constraint binds the scheduler, or merely
/// advises it. Advisory accessors may be re-targeted under allocation
/// pressure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DevicePolicy {
    #[default]
    Mandatory,
    Advisory,
}

#[derive(Debug, Clone)]
pub struct Accessor {
    buffer: Buffer,
    mode: AccessMode,
    loc: DeviceLoc,
    space: AddressSpace,
    policy: DevicePolicy,
}

impl Accessor {
    pub(crate) fn new(buffer: Buffer, mode: AccessMode, loc: DeviceLoc) -> Self {
        Self {
            buffer,
            mode,
            loc,
            space: AddressSpace::Global,
            policy: DevicePolicy::default(),
        }
    }

    /// Tags the accessor with an address space. `Local` and `Private`
    /// accessors declare kernel-scoped scratch: they never participate in
    /// hazard analysis or coherence.
    pub fn space(mut self, space: AddressSpace) -> Self {
        self.space = space;
        self
    }

    /// Makes the device constraint advisory.
    pub fn advisory(mut self) -> Self {
        self.policy = DevicePolicy::Advisory;
        self
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[inline]
    pub fn loc(&self) -> DeviceLoc {
        self.loc
    }

    #[inline]
    pub fn address_space(&self) -> AddressSpace {
        self.space
    }

    #[inline]
    pub fn policy(&self) -> DevicePolicy {
        self.policy
    }

    /// Whether this accessor's effects are visible across operations.
    #[inline]
    pub(crate) fn hazard_tracked(&self) -> bool {
        self.space.hazard_tracked()
    }

    pub(crate) fn binding(&self) -> Binding {
        Binding {
            id: self.buffer.id(),
            size: self.buffer.data_size(),
            access: self.mode,
            scratch: !self.hazard_tracked(),
        }
    }
}

impl std::fmt::Display for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} on {} ({})",
            self.mode,
            self.buffer.id(),
            self.loc,
            self.space
        )
    }
}
