//! Request handlers for the activities API.

mod activities;

pub use activities::*;
