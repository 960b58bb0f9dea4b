//! Small coordination primitives shared by the analyzers and the remove engine.

mod admission;
mod first_error;
mod wait;

pub use admission::{AdmissionPermit, AdmissionPool};
pub use first_error::FirstError;
pub use wait::WaitCounter;
