//! CarLang: a small C-like language for steering cars around a road grid.
//!
//! Source goes through [`lexer`], [`parser`] and [`analyzer`]; the
//! [`engine`] then runs the program one transition at a time against cars
//! provided through [`engine::dispatch::Agent`]. [`world`] is a simple grid
//! world for running scripts outside a game.

pub mod analyzer;
pub mod engine;
pub mod errors;
pub mod lexer;
pub mod parser;
pub mod world;
