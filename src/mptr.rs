//! Address-space qualified pointers as they appear inside kernel bodies.
//!
//! A [`MultiPtr`] carries its memory-space provenance and decoration mode
//! beside the raw pointer value. Conversion legality is a small explicit rule
//! table: a [`AddressSpace::Generic`] pointer may be narrowed to any concrete
//! space (the target space is asserted, not derived), a concrete pointer
//! always widens back to generic, and narrowing between two concrete spaces
//! is rejected.
//!
//! The scheduler cares about this model only through
//! [`AddressSpace::hazard_tracked`]: `Local` and `Private` pointers alias
//! exclusively within one kernel invocation's execution unit and never
//! participate in cross-operation hazard analysis.

use std::marker::PhantomData;

use derive_more::Display;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AddressSpace {
    #[display("global")]
    Global,
    #[display("local")]
    Local,
    #[display("private")]
    Private,
    #[display("generic")]
    Generic,
}

/// Whether the address-space tag is retained in the pointer's runtime
/// representation. `Legacy` exists for code predating explicit decoration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Decoration {
    #[display("decorated")]
    Yes,
    #[default]
    #[display("undecorated")]
    No,
    #[display("legacy")]
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("illegal address space conversion: {0} to {1}")]
    IllegalAddressSpace(AddressSpace, AddressSpace),
}

impl AddressSpace {
    /// The conversion rule table.
    #[inline]
    pub fn convertible_to(self, target: AddressSpace) -> bool {
        match (self, target) {
            (x, y) if x == y => true,
            // widening to generic is always implicit
            (_, AddressSpace::Generic) => true,
            // narrowing from generic asserts the target space
            (AddressSpace::Generic, _) => true,
            // cross-narrowing between concrete spaces
            _ => false,
        }
    }

    /// Whether accesses through this space are visible across operations.
    /// A generic pointer may carry global provenance and is tracked
    /// conservatively.
    #[inline]
    pub fn hazard_tracked(self) -> bool {
        matches!(self, AddressSpace::Global | AddressSpace::Generic)
    }
}

/// A pointer value tagged with address space and decoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiPtr<T> {
    ptr: *mut T,
    space: AddressSpace,
    decoration: Decoration,
    phantom: PhantomData<T>,
}

impl<T> MultiPtr<T> {
    #[inline]
    pub fn null(space: AddressSpace) -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            space,
            decoration: Decoration::default(),
            phantom: PhantomData,
        }
    }

    /// Tags a borrowed value with the given address space.
    #[inline]
    pub fn from_mut(value: &mut T, space: AddressSpace) -> Self {
        Self {
            ptr: value as *mut T,
            space,
            decoration: Decoration::default(),
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    #[inline]
    pub fn decoration(&self) -> Decoration {
        self.decoration
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// The underlying raw pointer, erased of its qualifiers.
    #[inline]
    pub fn get(&self) -> *mut T {
        self.ptr
    }

    /// Widens to a generic pointer. Always legal.
    #[inline]
    pub fn widen(self) -> Self {
        Self {
            space: AddressSpace::Generic,
            ..self
        }
    }

    /// Narrows to a concrete space. The target space is asserted: narrowing a
    /// generic pointer to a space it does not actually point into is undefined
    /// behavior at the hardware level, not a runtime-checked error. Narrowing
    /// between two concrete spaces is rejected.
    #[inline]
    pub fn narrow(self, space: AddressSpace) -> Result<Self, ConversionError> {
        match self.space.convertible_to(space) {
            true => Ok(Self { space, ..self }),
            false => Err(ConversionError::IllegalAddressSpace(self.space, space)),
        }
    }

    /// Switches the decoration mode. Decoration never affects legality, only
    /// whether the tag survives in the runtime representation.
    #[inline]
    pub fn with_decoration(self, decoration: Decoration) -> Self {
        Self { decoration, ..self }
    }

    /// Offsets the pointer by `count` elements.
    ///
    /// # Safety
    /// The result must stay within the allocation the pointer was derived
    /// from.
    #[inline]
    pub unsafe fn add(self, count: usize) -> Self {
        Self {
            ptr: unsafe { self.ptr.add(count) },
            ..self
        }
    }

    /// # Safety
    /// The pointer must be valid for reads.
    #[inline]
    pub unsafe fn read(&self) -> T
    where
        T: Copy,
    {
        unsafe { self.ptr.read() }
    }

    /// # Safety
    /// The pointer must be valid for writes.
    #[inline]
    pub unsafe fn write(&self, value: T) {
        unsafe { self.ptr.write(value) }
    }
}

impl<T> From<&mut T> for MultiPtr<T> {
    #[inline]
    fn from(value: &mut T) -> Self {
        Self::from_mut(value, AddressSpace::Generic)
    }
}
