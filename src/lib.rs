//! User space side of the BPF maps a stack unwinding profiler reads from.
//!
//! The profiler proper works out what to unwind with; [`EbpfHandler`] puts it
//! where the BPF programs look for it.

pub mod address_mapping;
pub mod bpf;
pub mod capabilities;
pub mod error;
pub mod handler;
pub mod maps;
pub mod metrics;
pub mod stack_deltas;
pub mod update_pool;
pub mod util;

pub use error::HandlerError;
pub use handler::{required_map_specs, EbpfHandler, EbpfMaps, HandlerConfig};
