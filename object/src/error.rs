use thiserror::Error;

use crate::{Oop, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("invalid object handle {0:?}")]
    InvalidHandle(Oop),

    #[error("{oop:?} is not {expected}")]
    WrongKind { oop: Oop, expected: &'static str },

    #[error("index {index} out of bounds for {oop:?} (size {size})")]
    IndexOutOfBounds { oop: Oop, index: usize, size: usize },

    #[error("expected an object reference, got {0:?}")]
    NotAReference(Value),

    #[error("{0:?} is immutable")]
    Immutable(Oop),

    #[error("become: lists differ in length ({from} vs {to})")]
    LengthMismatch { from: usize, to: usize },
}
