//! Integration test suite modules

mod deadlock;
mod ownership;
mod scenarios;
mod shared;
