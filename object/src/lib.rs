mod value;
mod header;
mod error;
mod largeint;
mod objects;
mod memory;
mod special;
mod r#become;
mod gc;

pub use value::{Oop, Value, SMALL_INT_MAX, SMALL_INT_MIN, visit_oop};
pub use header::{Header, HeaderFlags};
pub use error::MemoryError;
pub use largeint::{LargeInteger, demote};
pub use objects::{
    BlockKey, Body, ClassBody, ClosureBody, CompiledCode, ContextBody, ContextLink,
    FrameMarker, InstanceFormat, MethodHeader, Object, LARGE_FRAME, SMALL_FRAME,
};
pub use memory::ObjectMemory;
pub use special::SpecialObjects;
pub use gc::{GcStats, RootProvider};
