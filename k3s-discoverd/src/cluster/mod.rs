//! Narrow interfaces over the external helpers the coordinator drives.

pub mod elector;
pub mod installer;
pub mod probe;
