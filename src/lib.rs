//! Constant folding & propagation over a small textual IR.
//!
//! The crate has three parts: [commons] holds shared plumbing, [lir] defines
//! the IR (parsing, printing, validation, a reference interpreter), and
//! [optimization] holds the folding pass itself.

pub mod commons;
pub mod lir;
pub mod optimization;
