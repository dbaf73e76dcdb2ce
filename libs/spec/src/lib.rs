//! # hearth-spec
//!
//! Types describing one managed virtual machine and the guest-side wire
//! formats the host agent consumes.
//!
//! The specification is loaded by an outer tool and handed to the agent as an
//! immutable value; nothing in this crate performs I/O beyond JSON decoding.

mod error;
mod guest;
mod size;
mod vm;

pub use error::SpecError;
pub use guest::*;
pub use size::parse_ram_size;
pub use vm::*;
