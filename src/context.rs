//! The per-invocation record threaded through every stage of a pipeline

/// The maximum size, in bytes, of a [`Context`]
///
/// This matches the space the kernel makes available to carry state across
/// a tail call (eg. the XDP metadata area), so a context that fits here can
/// be carried by a real tail call as well as by [`crate::Pipeline`]
pub const MAX_CONTEXT_SIZE: usize = 64;

/// A small, fixed layout value carried between stages
///
/// The context is copied, never aliased, across a transfer. Only stages
/// interpret its fields; the dispatch machinery only relies on it being
/// `Copy` (so it cannot own heap data) and at most [`MAX_CONTEXT_SIZE`] bytes,
/// which is checked at compile time when a [`crate::DispatchTableBuilder`]
/// is created for it.
///
/// ```
/// #[derive(Copy, Clone, Default)]
/// struct Flow {
///     ifindex: u32,
///     l4_offset: u16,
///     mark: u16,
/// }
///
/// impl pktpipe::Context for Flow {}
/// ```
pub trait Context: Copy + Default + 'static {}

impl Context for () {}

macro_rules! scalar_context {
    ($($int:ty),+) => {
        $(impl Context for $int {})+
    };
}

scalar_context!(u8, u16, u32, u64);

struct AssertContextSize<C>(std::marker::PhantomData<C>);

impl<C> AssertContextSize<C> {
    const OK: () = assert!(
        std::mem::size_of::<C>() <= MAX_CONTEXT_SIZE,
        "pipeline contexts must fit in MAX_CONTEXT_SIZE bytes"
    );
}

#[doc(hidden)]
pub const fn assert_context_size<C: Context>() {
    let () = AssertContextSize::<C>::OK;
}
