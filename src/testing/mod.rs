//! Test doubles for driving a session without a broker

pub mod mocks;

pub use mocks::*;
