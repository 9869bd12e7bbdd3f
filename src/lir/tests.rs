//! Tests for the IR itself: constants, parsing & printing, validation, and
//! the interpreter.

use super::*;


// parse and validate; panics on malformed test input.
fn valid(code: &str) -> Valid<Program> {
    code.parse::<Program>().unwrap().validate().unwrap()
}
