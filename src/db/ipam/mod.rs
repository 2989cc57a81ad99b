mod allocations;
mod pools;

pub use allocations::*;
pub use pools::*;
