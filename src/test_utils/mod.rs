//! the test_utils folder here will share utils or test components between unit
//! tests in different modules
mod common;

pub use common::*;
