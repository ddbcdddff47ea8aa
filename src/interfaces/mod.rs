//! Interface adapters.
//!
//! This module contains the code that drives the engine from the outside
//! world: the CSV command script reader, the command runner and the balance
//! report writer.

pub mod csv;
pub mod runner;
