//! Wire layer between the host and a worker.
//!
//! # Architecture
//!
//! - **codec**: 16-byte hex header framing, transport escaping of worker bodies
//! - **literal**: host→worker values as literal text the worker can evaluate
//! - **notation**: worker→host values in length-prefixed tagged notation
//! - **protocol**: typed messages for both directions

pub mod codec;
pub mod literal;
pub mod notation;
pub mod protocol;
