//! Internal data structures.

pub(crate) mod table;
