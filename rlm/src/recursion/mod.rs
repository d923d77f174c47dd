//! Recursive completion: the generate → execute → observe loop

mod controller;
pub mod parser;

pub use controller::{ChildSpawner, Completion, ControllerSettings, RecursionController};
pub use parser::extract_program;
