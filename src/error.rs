use std::io;

use itertools::Itertools;
use thiserror::Error;

use crate::bpf::{BiasOutOfRange, InterpreterType};
use crate::maps::{BatchError, MapError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no stack delta map fits {deltas} deltas (max {max})")]
    CapacityExceeded { deltas: usize, max: u64 },
    #[error("invalid stack delta bucket {0}")]
    InvalidBucket(u16),
    #[error("{pages} pages starting at 0x{first_page:x} run past the address space")]
    PageOutOfRange { first_page: u64, pages: usize },
    #[error("expected {expected} outer stack delta maps, got {got}")]
    OuterMapCount { expected: usize, got: usize },
    #[error(transparent)]
    EncodingRangeExceeded(#[from] BiasOutOfRange),
    #[error("interpreter type {0:?} is not supported")]
    UnsupportedInterpreterType(InterpreterType),
    #[error("unwind info array full ({index}/{capacity} items)")]
    IndexOutOfRange { index: u16, capacity: u32 },
    #[error("expected one or two interpreter ranges, got {0}")]
    InvalidRanges(usize),
    #[error("prefix of {0} bits is longer than a page address")]
    InvalidPrefix(u32),
    #[error("map {0} is not available")]
    MissingMap(String),
    #[error("failed to spawn map update workers: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("{}", .0.iter().join("; "))]
    Multiple(Vec<MapError>),
    /// Not every requested entry could be deleted, `deleted` were.
    #[error("deleted {deleted} of {requested} entries: {source}")]
    PartialDelete {
        deleted: usize,
        requested: usize,
        #[source]
        source: Box<HandlerError>,
    },
}

impl HandlerError {
    /// The underlying map error for single element operations, to tell the
    /// expected races (`AlreadyExists`, `NotFound`) apart.
    pub fn map_error(&self) -> Option<&MapError> {
        match self {
            HandlerError::Map(e) => Some(e),
            HandlerError::Batch(e) => Some(&e.source),
            _ => None,
        }
    }
}
