//! # Hornlog
//!
//! A miniature Horn-clause resolution engine in Rust: a database of typed
//! facts and rules, queried with partially-bound argument tuples and
//! resolved through unification and chronological backtracking.
//!
//! ## Features
//!
//! - Fact sets with idempotent assertion and retraction
//! - Disjunctive rule clauses resolved top-down, depth-first
//! - Negation-as-failure for grounded subgoals
//! - An additive builtin for neighbor-style integer offsets
//! - Solutions enumerated through a callback, with early stop
//!
//! ## Example
//!
//! ```rust
//! use hornlog::{Control, Database, Term, Value, ValueType};
//!
//! let mut db = Database::new();
//! db.declare_fact_predicate("edge", &[ValueType::Int, ValueType::Int])?;
//! db.insert_fact("edge", vec![Value::Int(1), Value::Int(2)])?;
//!
//! let query = db.create_query("edge", vec![Term::int(1), Term::var("Y")])?;
//! let count = query.solve(|row| {
//!     assert_eq!(row, [Value::Int(2)]);
//!     Control::Continue
//! });
//! assert_eq!(count, 1);
//! # Ok::<(), hornlog::ConfigError>(())
//! ```

/// Resolution engine.
pub mod engine;
pub use engine::{
    Clause, ConfigError, Control, Database, Polarity, Query, Subgoal, Term, Value, ValueType,
};
