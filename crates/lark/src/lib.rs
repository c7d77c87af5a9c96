//! lark — a small dynamically typed scripting language.
//!
//! The crate is the language core: a single-pass bytecode compiler, a
//! stack-based virtual machine, and a mark-sweep garbage collector with
//! string interning. The language has numbers, booleans, nil, strings,
//! first-class functions, closures with upvalues, classes with single
//! inheritance, bound methods, getters, and lists.
//!
//! # Quick start
//!
//! ```
//! use lark::Interpreter;
//!
//! let mut interpreter = Interpreter::new();
//! interpreter.capture_output();
//! interpreter
//!     .interpret(
//!         r#"
//! fun make() {
//!     var count = 0;
//!     fun tick() {
//!         count = count + 1;
//!         return count;
//!     }
//!     return tick;
//! }
//! var tick = make();
//! tick();
//! print tick();
//! "#,
//!     )
//!     .unwrap();
//! assert_eq!(interpreter.take_output(), "2\n");
//! ```
//!
//! # Language surface
//!
//! * Statements: `var`, `fun`, `class` (with `< Super`), `if`/`else`,
//!   `while`, `for`, `break`/`continue`, `return`, `print`, blocks.
//! * Expressions: arithmetic with right-associative `^`, comparison,
//!   `and`/`or`, `?:`, the comma operator, calls, property access,
//!   `this`/`super`, list literals and subscripts, anonymous `fun`
//!   expressions.
//! * Methods declared without a parameter list are getters and run on
//!   property access.
//!
//! Natives: `clock()` (seconds since start), `len(list)`, `gc()`.

mod chunk;
mod compiler;
mod debug;
mod error;
mod heap;
mod interpreter;
mod natives;
mod object;
mod scanner;
mod table;
mod value;
mod vm;

pub use error::{Error, Result};
pub use interpreter::{Interpreter, Options};
