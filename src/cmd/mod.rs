//! Command-line argument structs, one per role.

pub mod master;
pub mod worker;
