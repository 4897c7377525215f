//! Pit deduction on a small Wumpus-style grid.
//!
//! A walled 4x4 cave is explored from the corner; the knowledge base
//! records which tiles were visited and where a breeze was felt, then
//! enumerates every tile that provably cannot contain a pit.
//!
//! Run with `RUST_LOG=debug` to watch rule registration and query counts.

use anyhow::Result;
use hornlog::{Clause, Control, Database, Subgoal, Term, Value, ValueType};
use std::collections::BTreeSet;

const COORD: [ValueType; 2] = [ValueType::Int, ValueType::Int];
const SIZE: i64 = 4;

fn declare(db: &mut Database) -> Result<()> {
    db.declare_fact_predicate("visited", &COORD)?;
    db.declare_fact_predicate("breeze", &COORD)?;
    db.declare_fact_predicate("pit_death", &COORD)?;
    db.declare_fact_predicate("obstacle", &COORD)?;
    db.declare_sum_predicate("sum")?;
    db.declare_rule_predicate("no_breeze", &COORD)?;
    db.declare_rule_predicate("neighbor", &[ValueType::Int; 4])?;
    db.declare_rule_predicate("not_pit", &COORD)?;
    Ok(())
}

fn register_rules(db: &mut Database) -> Result<()> {
    // A visited tile without an obstacle and without a recorded breeze
    // is breeze-free.
    db.register_rule(
        "no_breeze",
        Clause::new(
            ["X", "Y"],
            vec![
                Subgoal::pos("visited", vec![Term::var("X"), Term::var("Y")]),
                Subgoal::neg("obstacle", vec![Term::var("X"), Term::var("Y")]),
                Subgoal::neg("breeze", vec![Term::var("X"), Term::var("Y")]),
            ],
        ),
    )?;

    // neighbor(X, Y, XN, YN): one clause per direction, derived through
    // the additive builtin.
    for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
        let (xn, yn, body) = if dx == 0 {
            (
                "X",
                "B",
                Subgoal::pos("sum", vec![Term::var("B"), Term::var("Y"), Term::int(dy)]),
            )
        } else {
            (
                "A",
                "Y",
                Subgoal::pos("sum", vec![Term::var("A"), Term::var("X"), Term::int(dx)]),
            )
        };
        db.register_rule("neighbor", Clause::new(["X", "Y", xn, yn], vec![body]))?;
    }

    // A wall tile cannot hold a pit.
    db.register_rule(
        "not_pit",
        Clause::new(
            ["X", "Y"],
            vec![Subgoal::pos("obstacle", vec![Term::var("X"), Term::var("Y")])],
        ),
    )?;

    // Neither can a tile we stood on and survived.
    db.register_rule(
        "not_pit",
        Clause::new(
            ["X", "Y"],
            vec![
                Subgoal::pos("visited", vec![Term::var("X"), Term::var("Y")]),
                Subgoal::neg("pit_death", vec![Term::var("X"), Term::var("Y")]),
            ],
        ),
    )?;

    // Nor a tile bordering a breeze-free tile.
    db.register_rule(
        "not_pit",
        Clause::new(
            ["X", "Y"],
            vec![
                Subgoal::pos("no_breeze", vec![Term::var("A"), Term::var("B")]),
                Subgoal::pos(
                    "neighbor",
                    vec![
                        Term::var("A"),
                        Term::var("B"),
                        Term::var("X"),
                        Term::var("Y"),
                    ],
                ),
            ],
        ),
    )?;
    Ok(())
}

fn observe(db: &mut Database) -> Result<()> {
    // The cave border counts as visited obstacle tiles, so the agent can
    // reason about bumping into walls.
    for i in 0..SIZE {
        for (x, y) in [(i, -1), (i, SIZE), (-1, i), (SIZE, i)] {
            db.insert_fact("obstacle", vec![Value::Int(x), Value::Int(y)])?;
            db.insert_fact("visited", vec![Value::Int(x), Value::Int(y)])?;
        }
    }

    // A short stroll along the bottom row; the breeze at (2, 0) hints at
    // a pit somewhere around it.
    for (x, y) in [(0, 0), (1, 0), (2, 0), (0, 1)] {
        db.insert_fact("visited", vec![Value::Int(x), Value::Int(y)])?;
    }
    db.insert_fact("breeze", vec![Value::Int(2), Value::Int(0)])?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut db = Database::new();
    declare(&mut db)?;
    register_rules(&mut db)?;
    observe(&mut db)?;

    let query = db.create_query("not_pit", vec![Term::var("X"), Term::var("Y")])?;
    let mut tiles = BTreeSet::new();
    query.solve(|row| {
        tiles.insert((row[0].clone(), row[1].clone()));
        Control::Continue
    });

    println!("tiles that cannot contain a pit:");
    for (x, y) in &tiles {
        println!("  ({x}, {y})");
    }
    println!("{} distinct tiles", tiles.len());

    Ok(())
}
