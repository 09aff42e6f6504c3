#![warn(missing_docs)]

//! Operator tooling for shingle translation layer volumes.

pub mod cli;
