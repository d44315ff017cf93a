//! Reads WebNN conformance fixture scripts.
//!
//! A fixture is a JavaScript file that declares an array of test cases and
//! then hands it to the browser test harness. Only the declaration is of
//! interest: it is located structurally and evaluated by a small interpreter
//! for the data subset of the language (see [`eval`]).

pub mod case;
pub mod eval;
pub mod lexer;

use std::time::Duration;

use thiserror::Error;

pub use case::{extract_test_cases, TestCase};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("No top-level array declaration found")]
    NoDeclaration,

    #[error("Syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Evaluation failed on line {line}: {message}")]
    Evaluation { line: usize, message: String },

    #[error("Extraction exceeded its budget of {0:?}")]
    Timeout(Duration),

    #[error("'{0}' does not evaluate to an array")]
    NotAnArray(String),

    #[error("Test case #{index}: {message}")]
    InvalidCase { index: usize, message: String },
}
