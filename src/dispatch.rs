//! The table of stages a pipeline can transfer between
//!
//! A [`DispatchTable`] is the userspace counterpart of a
//! `BPF_MAP_TYPE_PROG_ARRAY`: it is filled in once via a
//! [`DispatchTableBuilder`] at load time and is read-only afterwards. Stages
//! never call each other, instead they return [`Outcome::Continue`] and the
//! trampoline in [`crate::Pipeline`] looks the next stage up here.

use crate::{
    context::{self, Context},
    pipeline::Invocation,
};
use std::fmt;

/// The entry point of a stage
///
/// The stage receives the packet and shared state through the
/// [`Invocation`], and the context carried over from the previous stage by
/// value. Whatever it returns is final for this stage, there is no way for
/// control to come back to it.
pub type StageFn<C> = fn(&mut Invocation<'_, '_>, C) -> Outcome<C>;

/// What should finally happen to a packet, mirroring the XDP actions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The packet could not be processed, eg. due to a dispatch failure
    Aborted,
    /// Drop the packet
    Drop,
    /// Pass the packet on to the normal network stack
    Pass,
    /// Bounce the packet back out of the interface it arrived on
    Tx,
    /// Redirect the packet to another interface
    Redirect {
        /// The interface index to redirect to
        ifindex: u32,
    },
}

/// The result of running a single stage
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome<C> {
    /// Transfer to another stage, carrying the context along
    Continue {
        /// The index of the stage to transfer to
        next: u32,
        /// The context handed to the next stage
        context: C,
    },
    /// Processing has finished
    Terminal(Disposition),
}

impl<C> Outcome<C> {
    /// Requests a transfer to the stage at `next`
    #[inline]
    pub fn transfer(next: u32, context: C) -> Self {
        Self::Continue { next, context }
    }

    /// Requests a transfer to the stage at `next` if `condition` holds,
    /// otherwise finishes with `otherwise`
    #[inline]
    pub fn transfer_if(condition: bool, next: u32, context: C, otherwise: Disposition) -> Self {
        if condition {
            Self::Continue { next, context }
        } else {
            Self::Terminal(otherwise)
        }
    }

    /// True if this is a terminal outcome
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

impl<C> From<Disposition> for Outcome<C> {
    #[inline]
    fn from(disposition: Disposition) -> Self {
        Self::Terminal(disposition)
    }
}

/// Errors that can occur when registering or transferring to a stage
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The index is outside the table, or the slot it names is empty
    InvalidIndex {
        /// The requested index
        index: u32,
        /// The fixed capacity of the table
        capacity: u32,
    },
    /// A stage has already been registered at the index
    AlreadyRegistered {
        /// The requested index
        index: u32,
    },
    /// The invocation attempted more transfers than allowed
    ChainLimit {
        /// The maximum number of transfers per invocation
        limit: u32,
    },
}

impl DispatchError {
    /// Gets a static string description of the error
    #[inline]
    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::InvalidIndex { .. } => "invalid index",
            Self::AlreadyRegistered { .. } => "already registered",
            Self::ChainLimit { .. } => "chain limit",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIndex { index, capacity } => write!(
                f,
                "no stage registered at index {index} (table capacity {capacity})"
            ),
            Self::AlreadyRegistered { index } => {
                write!(f, "a stage is already registered at index {index}")
            }
            Self::ChainLimit { limit } => {
                write!(f, "exceeded the maximum of {limit} transfers")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

struct AssertCapacity<const N: usize>;

impl<const N: usize> AssertCapacity<N> {
    const OK: () = assert!(
        N > 0 && N <= u32::MAX as usize,
        "dispatch tables must have a capacity in 1..=u32::MAX"
    );
}

/// Builds a [`DispatchTable`] with a fixed capacity of `N` stages
///
/// Stages can only be added here, the built table can't be modified
pub struct DispatchTableBuilder<C: Context, const N: usize> {
    stages: [Option<StageFn<C>>; N],
}

impl<C: Context, const N: usize> DispatchTableBuilder<C, N> {
    /// Creates an empty builder
    ///
    /// Fails to compile if `C` is larger than [`context::MAX_CONTEXT_SIZE`]
    /// or `N` is zero
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        context::assert_context_size::<C>();
        let () = AssertCapacity::<N>::OK;

        Self { stages: [None; N] }
    }

    /// Registers the stage entry point at `index`
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidIndex`] if `index` is not below `N`
    /// - [`DispatchError::AlreadyRegistered`] if the slot is already taken
    pub fn register(&mut self, index: u32, stage: StageFn<C>) -> Result<&mut Self, DispatchError> {
        let slot = self
            .stages
            .get_mut(index as usize)
            .ok_or(DispatchError::InvalidIndex {
                index,
                capacity: N as u32,
            })?;

        if slot.is_some() {
            return Err(DispatchError::AlreadyRegistered { index });
        }

        *slot = Some(stage);
        Ok(self)
    }

    /// Finalizes the table
    #[inline]
    pub fn build(self) -> DispatchTable<C, N> {
        DispatchTable {
            stages: self.stages,
        }
    }
}

/// An immutable table of up to `N` stages, addressed by index
pub struct DispatchTable<C: Context, const N: usize> {
    stages: [Option<StageFn<C>>; N],
}

impl<C: Context, const N: usize> DispatchTable<C, N> {
    /// The fixed number of slots in the table
    #[inline]
    pub fn capacity(&self) -> u32 {
        N as u32
    }

    /// The number of slots that have a stage registered
    #[inline]
    pub fn registered(&self) -> usize {
        self.stages.iter().filter(|stage| stage.is_some()).count()
    }

    /// True if a stage is registered at `index`
    #[inline]
    pub fn is_registered(&self, index: u32) -> bool {
        self.lookup(index).is_some()
    }

    /// Gets the stage at `index`, if any
    #[inline]
    pub fn lookup(&self, index: u32) -> Option<StageFn<C>> {
        self.stages.get(index as usize).copied().flatten()
    }

    /// Resolves the target of a transfer to `index`
    ///
    /// This is the only check standing between a stage's request and the
    /// stage being entered, nothing is invoked if it fails
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidIndex`] if the index is out of range or the
    /// slot is empty
    #[inline]
    pub fn transfer(&self, index: u32) -> Result<StageFn<C>, DispatchError> {
        self.lookup(index).ok_or(DispatchError::InvalidIndex {
            index,
            capacity: N as u32,
        })
    }
}

impl<C: Context, const N: usize> fmt::Debug for DispatchTable<C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("capacity", &N)
            .field("registered", &self.registered())
            .finish()
    }
}
