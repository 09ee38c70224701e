//! Command-line interface

mod args;

pub use args::{parse_key_values, Args, SubCommand, SubjectArgs};
