//! Utilities shared across the crate.

// use ordered sets and maps to allow for deterministic outputs.
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// A witness that a value passed validation.  Passes take and return
/// `Valid<Program>` so that an unvalidated program cannot reach the
/// optimizer by accident.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);
