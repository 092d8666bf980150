//! Compile-time configuration constants shared by all memory-management crates.
//!
//! * [`memory`]: page geometry and the reserved slots of each root page table.
//! * [`working_set`]: default working-set limits and replacement tuning knobs.

#![no_std]

pub mod memory;
pub mod working_set;
