//! CSV adapters for the command-line interface.

pub mod balance_writer;
pub mod command_reader;
