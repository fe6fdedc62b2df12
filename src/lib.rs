#[cfg(not(target_pointer_width = "64"))]
compile_error!("scatterheap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// heap surface
pub use memory::heap::{GlobalScatterHeap, HeapConfig, ScatterHeap};
pub use memory::partition::FillPolicy;

// errors
pub use memory::vm::VmError;
