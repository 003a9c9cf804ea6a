//! Backing data structures shared by all managers.

pub mod arena;
