//! Tests for the fiber interpreter
//!
//! Organized by feature area

mod basic_tests;
