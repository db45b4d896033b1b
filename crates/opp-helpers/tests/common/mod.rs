//! Shared helpers for the opp-helpers integration tests

#![allow(dead_code)]

mod logs;
mod mock_entity;
mod mock_platform;
mod test_opp;

pub use logs::*;
pub use mock_entity::*;
pub use mock_platform::*;
pub use test_opp::*;
