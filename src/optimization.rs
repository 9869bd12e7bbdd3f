//! Optimization passes over lir programs.

use derive_more::Display;

pub mod constant_fold;


pub use constant_fold::{constant_fold, fold_constants, ArithmeticError};

/// Whether a pass changed the program it was given.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Changed {
    Yes,
    No,
}

/// What the rewrite driver does when a fold divides by zero.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, clap::ValueEnum)]
pub enum DivZeroPolicy {
    /// Leave the instruction unfolded and keep going.
    #[default]
    #[display(fmt = "skip")]
    Skip,
    /// Stop the pass and report the error.
    #[display(fmt = "abort")]
    Abort,
}

/// Configuration for the constant folding pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct FoldOptions {
    pub div_zero: DivZeroPolicy,
    /// Print a diagnostic line to stderr for every fold.
    pub trace: bool,
}
