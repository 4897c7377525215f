use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};
use smallvec::SmallVec;
use std::fmt;

/// The scalar types a predicate argument can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// Signed integer arguments (e.g. grid coordinates)
    Int,
    /// Symbolic/atom arguments (e.g. `"alice"`, `"north"`)
    Sym,
}

/// An immutable, equality-comparable scalar used as a fact argument and as
/// the payload of a variable binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// A signed integer
    Int(i64),
    /// A symbol/constant
    Sym(String),
}

impl Value {
    /// The declared type this value inhabits.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Sym(_) => ValueType::Sym,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Sym(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Sym(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Sym(value)
    }
}

/// One argument position of a subgoal call or a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Term {
    /// A named variable. In a query this is an unknown to enumerate; in a
    /// rule body the first occurrence introduces a fresh cell and later
    /// occurrences refer back to it.
    Var(String),
    /// A literal value, solved against a pre-bound constant cell.
    Lit(Value),
}

impl Term {
    /// A variable term.
    pub fn var<S: Into<String>>(name: S) -> Self {
        Self::Var(name.into())
    }

    /// A literal term.
    pub fn lit<V: Into<Value>>(value: V) -> Self {
        Self::Lit(value.into())
    }

    /// An integer literal term.
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Lit(Value::Int(value))
    }

    /// A symbol literal term.
    pub fn sym<S: Into<String>>(value: S) -> Self {
        Self::Lit(Value::Sym(value.into()))
    }
}

/// Whether a subgoal must be proven or must fail to be proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    /// The subgoal must have at least one solution for the clause to
    /// proceed; each solution is explored on backtracking.
    Positive,
    /// Negation-as-failure: the subgoal must have no solution. Such a call
    /// may not introduce new variables.
    Negative,
}

/// One conjunct within a clause body.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Subgoal {
    /// Positive or negated call
    pub polarity: Polarity,
    /// The name of the predicate to call
    pub predicate: String,
    /// The call arguments, one per parameter position of the target
    pub terms: Vec<Term>,
}

impl Subgoal {
    /// A positive call on `predicate`.
    pub fn pos<S: Into<String>>(predicate: S, terms: Vec<Term>) -> Self {
        Self {
            polarity: Polarity::Positive,
            predicate: predicate.into(),
            terms,
        }
    }

    /// A negated call on `predicate`.
    pub fn neg<S: Into<String>>(predicate: S, terms: Vec<Term>) -> Self {
        Self {
            polarity: Polarity::Negative,
            predicate: predicate.into(),
            terms,
        }
    }
}

/// One alternative definition (disjunct) of a rule predicate: a parameter
/// name list naming the rule's own positional arguments, plus an ordered
/// subgoal sequence.
///
/// Repeating a name in `params` aliases the corresponding caller argument
/// positions to a single variable (e.g. `neighbor(X, Y, L, Y)` requires the
/// second and fourth arguments to agree).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Clause {
    /// Names for the rule's positional parameters
    pub params: Vec<String>,
    /// The conjuncts to satisfy, in order
    pub body: Vec<Subgoal>,
}

impl Clause {
    /// Build a clause from parameter names and a body.
    pub fn new<P, S>(params: P, body: Vec<Subgoal>) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            body,
        }
    }
}

/// Search control, returned by solution callbacks and threaded through the
/// resolution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep searching for further solutions
    Continue,
    /// Satisfied; unwind the whole search
    Stop,
}

/// A configuration-time fault, detected when facts are asserted, rules are
/// registered or queries are constructed, never in the middle of a search.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The named predicate was never declared
    #[error("unknown predicate `{0}`")]
    UnknownPredicate(String),
    /// A predicate with this name already exists
    #[error("predicate `{0}` is already declared")]
    DuplicatePredicate(String),
    /// A call, fact or clause head has the wrong number of arguments
    #[error("`{predicate}` expects {expected} arguments, got {found}")]
    ArityMismatch {
        /// The predicate being called or asserted
        predicate: String,
        /// Its declared arity
        expected: usize,
        /// The arity supplied
        found: usize,
    },
    /// A value or literal does not inhabit the declared argument type
    #[error("argument {position} of `{predicate}` expects {expected:?}, got {found:?}")]
    ValueTypeMismatch {
        /// The predicate being called or asserted
        predicate: String,
        /// Zero-based argument position
        position: usize,
        /// The declared type at that position
        expected: ValueType,
        /// The type supplied
        found: ValueType,
    },
    /// The same variable name is used at two different value types within
    /// one clause or query
    #[error("variable `{0}` is used at two different value types")]
    TypeConflict(String),
    /// Facts were asserted on or requested from a non-fact predicate
    #[error("`{0}` does not store facts")]
    NotAFactPredicate(String),
    /// A clause was registered on a non-rule predicate
    #[error("`{0}` does not store rules")]
    NotARulePredicate(String),
    /// A negated subgoal names a variable not introduced earlier in the
    /// clause; negation-as-failure requires grounded calls
    #[error("negated call to `{predicate}` introduces new variable `{variable}`")]
    NegationIntroducesVariable {
        /// The negated predicate
        predicate: String,
        /// The offending variable name
        variable: String,
    },
}

/// A single mutable binding slot: the atomic unit of the backtracking
/// trail. Constant cells are created pre-bound and stay bound forever.
///
/// The bind/unbind preconditions are contracts, not data conditions:
/// violating them means the trail discipline is broken, so they panic.
#[derive(Debug)]
struct BindingCell {
    constant: bool,
    slot: Option<Value>,
}

impl BindingCell {
    fn is_bound(&self) -> bool {
        self.slot.is_some()
    }

    fn bind(&mut self, value: Value) {
        assert!(!self.constant, "bind on a constant cell");
        assert!(self.slot.is_none(), "bind on an already-bound cell");
        self.slot = Some(value);
    }

    fn unbind(&mut self) {
        assert!(!self.constant, "unbind on a constant cell");
        assert!(self.slot.take().is_some(), "unbind on an unbound cell");
    }

    fn value(&self) -> &Value {
        self.slot.as_ref().expect("value read from an unbound cell")
    }
}

/// Index of a cell in the arena of one resolution run.
type CellId = usize;

/// Arena of binding cells for one resolution run. Cells are pushed as
/// scopes extend and released in LIFO order as subgoal alternatives
/// exhaust; every cell a frame binds, that frame unbinds.
#[derive(Debug, Default)]
struct CellArena {
    cells: Vec<BindingCell>,
}

impl CellArena {
    fn len(&self) -> usize {
        self.cells.len()
    }

    fn push_variable(&mut self) -> CellId {
        self.cells.push(BindingCell {
            constant: false,
            slot: None,
        });
        self.cells.len() - 1
    }

    fn push_constant(&mut self, value: Value) -> CellId {
        self.cells.push(BindingCell {
            constant: true,
            slot: Some(value),
        });
        self.cells.len() - 1
    }

    /// Release every cell allocated after `mark`.
    fn truncate(&mut self, mark: usize) {
        debug_assert!(
            self.cells[mark..]
                .iter()
                .all(|cell| cell.constant || cell.slot.is_none()),
            "released cells must be unbound"
        );
        self.cells.truncate(mark);
    }

    fn is_bound(&self, cell: CellId) -> bool {
        self.cells[cell].is_bound()
    }

    fn value(&self, cell: CellId) -> &Value {
        self.cells[cell].value()
    }

    fn bind(&mut self, cell: CellId, value: Value) {
        self.cells[cell].bind(value);
    }

    fn unbind(&mut self, cell: CellId) {
        self.cells[cell].unbind();
    }
}

/// One name->cell association in a scope frame.
#[derive(Debug)]
struct ScopeVar<'a> {
    name: &'a str,
    cell: CellId,
}

/// A parent-linked chain of scope frames. A clause invocation opens a fresh
/// chain (its parameters see only the aliased caller cells); each positive
/// subgoal pushes a frame holding the names it introduced, visible to the
/// rest of that clause body.
#[derive(Debug)]
struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    vars: Vec<ScopeVar<'a>>,
}

impl Scope<'_> {
    /// Newest-first lookup along the chain.
    fn resolve(&self, name: &str) -> Option<CellId> {
        self.vars
            .iter()
            .rev()
            .find(|var| var.name == name)
            .map(|var| var.cell)
            .or_else(|| self.parent.and_then(|parent| parent.resolve(name)))
    }
}

/// Index of a predicate in the database registry.
type PredId = usize;

/// A subgoal with its target resolved to a registry index. Produced by
/// `register_rule` after all configuration checks have passed.
#[derive(Debug)]
struct CompiledSubgoal {
    polarity: Polarity,
    target: PredId,
    terms: Vec<Term>,
}

#[derive(Debug)]
struct CompiledClause {
    params: Vec<String>,
    body: Vec<CompiledSubgoal>,
}

/// Per-predicate backing storage.
#[derive(Debug)]
enum Store {
    /// A deduplicated set of fact tuples
    Facts(IndexSet<Vec<Value>>),
    /// An ordered clause list; clause order decides trial order only
    Rules(Vec<CompiledClause>),
    /// The additive builtin relation `a = b + c` over integers
    Sum,
}

#[derive(Debug)]
struct Predicate {
    name: String,
    signature: Vec<ValueType>,
    store: Store,
}

/// A typed registry of predicates with their fact sets and rule clauses,
/// resolved through unification and chronological backtracking.
///
/// Predicates are declared up front; afterwards the database is mutated
/// only by fact insertion/removal and rule registration. Queries never
/// mutate it. One database must be driven by a single logical thread of
/// control at a time; independent databases are fully isolated.
///
/// ## Example
///
/// ```rust
/// use hornlog::{Clause, Database, Subgoal, Term, Value, ValueType};
///
/// let mut db = Database::new();
/// db.declare_fact_predicate("visited", &[ValueType::Int, ValueType::Int])?;
/// db.declare_fact_predicate("pit_death", &[ValueType::Int, ValueType::Int])?;
/// db.declare_rule_predicate("safe_visited", &[ValueType::Int, ValueType::Int])?;
///
/// db.register_rule(
///     "safe_visited",
///     Clause::new(
///         ["X", "Y"],
///         vec![
///             Subgoal::pos("visited", vec![Term::var("X"), Term::var("Y")]),
///             Subgoal::neg("pit_death", vec![Term::var("X"), Term::var("Y")]),
///         ],
///     ),
/// )?;
///
/// db.insert_fact("visited", vec![Value::Int(0), Value::Int(0)])?;
/// let query = db.create_query("safe_visited", vec![Term::int(0), Term::int(0)])?;
/// assert!(query.ask());
/// # Ok::<(), hornlog::ConfigError>(())
/// ```
#[derive(Debug)]
pub struct Database {
    predicates: IndexMap<String, Predicate>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self {
            predicates: IndexMap::new(),
        }
    }

    /// Declare a fact-backed predicate with the given argument types.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicatePredicate`] if the name is taken.
    pub fn declare_fact_predicate(
        &mut self,
        name: &str,
        signature: &[ValueType],
    ) -> Result<(), ConfigError> {
        self.declare(name, signature.to_vec(), Store::Facts(IndexSet::new()))
    }

    /// Declare a rule-backed predicate with the given argument types.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicatePredicate`] if the name is taken.
    pub fn declare_rule_predicate(
        &mut self,
        name: &str,
        signature: &[ValueType],
    ) -> Result<(), ConfigError> {
        self.declare(name, signature.to_vec(), Store::Rules(Vec::new()))
    }

    /// Declare the additive builtin under `name`: the relation
    /// `sum(A, B, C)` holds when `A = B + C`. Its signature is fixed at
    /// three integers. Solving computes whichever single argument is
    /// unbound from the other two; with two or more arguments unbound the
    /// call fails rather than enumerating integers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicatePredicate`] if the name is taken.
    pub fn declare_sum_predicate(&mut self, name: &str) -> Result<(), ConfigError> {
        self.declare(name, vec![ValueType::Int; 3], Store::Sum)
    }

    fn declare(
        &mut self,
        name: &str,
        signature: Vec<ValueType>,
        store: Store,
    ) -> Result<(), ConfigError> {
        if self.predicates.contains_key(name) {
            return Err(ConfigError::DuplicatePredicate(name.to_string()));
        }
        self.predicates.insert(
            name.to_string(),
            Predicate {
                name: name.to_string(),
                signature,
                store,
            },
        );
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<(PredId, &Predicate), ConfigError> {
        self.predicates
            .get_full(name)
            .map(|(id, _, predicate)| (id, predicate))
            .ok_or_else(|| ConfigError::UnknownPredicate(name.to_string()))
    }

    fn check_tuple(predicate: &Predicate, values: &[Value]) -> Result<(), ConfigError> {
        if values.len() != predicate.signature.len() {
            return Err(ConfigError::ArityMismatch {
                predicate: predicate.name.clone(),
                expected: predicate.signature.len(),
                found: values.len(),
            });
        }
        for (position, (value, &expected)) in
            values.iter().zip(&predicate.signature).enumerate()
        {
            if value.value_type() != expected {
                return Err(ConfigError::ValueTypeMismatch {
                    predicate: predicate.name.clone(),
                    position,
                    expected,
                    found: value.value_type(),
                });
            }
        }
        Ok(())
    }

    /// Assert a fact tuple. Set semantics: asserting a tuple that is
    /// already present is a no-op, and `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Fails if the predicate is unknown, not fact-backed, or the tuple
    /// does not match its signature.
    pub fn insert_fact(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ConfigError> {
        let (id, predicate) = self.lookup(name)?;
        Self::check_tuple(predicate, &values)?;
        if !matches!(predicate.store, Store::Facts(_)) {
            return Err(ConfigError::NotAFactPredicate(name.to_string()));
        }
        let (_, predicate) = self
            .predicates
            .get_index_mut(id)
            .expect("predicate ids are registry indexes");
        let Store::Facts(tuples) = &mut predicate.store else {
            unreachable!("store kind checked above");
        };
        let inserted = tuples.insert(values);
        if inserted {
            trace!("asserted fact on `{name}`");
        }
        Ok(inserted)
    }

    /// Retract a fact tuple. Removing a tuple that is not present is a
    /// no-op, and `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Fails if the predicate is unknown, not fact-backed, or the tuple
    /// does not match its signature.
    pub fn remove_fact(&mut self, name: &str, values: &[Value]) -> Result<bool, ConfigError> {
        let (id, predicate) = self.lookup(name)?;
        Self::check_tuple(predicate, values)?;
        if !matches!(predicate.store, Store::Facts(_)) {
            return Err(ConfigError::NotAFactPredicate(name.to_string()));
        }
        let (_, predicate) = self
            .predicates
            .get_index_mut(id)
            .expect("predicate ids are registry indexes");
        let Store::Facts(tuples) = &mut predicate.store else {
            unreachable!("store kind checked above");
        };
        let removed = tuples.shift_remove(values);
        if removed {
            trace!("retracted fact on `{name}`");
        }
        Ok(removed)
    }

    /// All fact tuples currently stored for a fact-backed predicate, in
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Fails if the predicate is unknown or not fact-backed.
    pub fn facts(&self, name: &str) -> Result<Vec<Vec<Value>>, ConfigError> {
        let (_, predicate) = self.lookup(name)?;
        let Store::Facts(tuples) = &predicate.store else {
            return Err(ConfigError::NotAFactPredicate(name.to_string()));
        };
        Ok(tuples.iter().cloned().collect())
    }

    /// Register a clause for a rule predicate. Clauses are disjunctive:
    /// the rule is satisfied if any clause is. Registration validates the
    /// whole clause (subgoal arities and argument types, one type per
    /// variable name across the chain, groundedness of negated calls), so
    /// no configuration fault can surface mid-search.
    ///
    /// # Errors
    ///
    /// Fails with the corresponding [`ConfigError`] on any of the above.
    pub fn register_rule(&mut self, name: &str, clause: Clause) -> Result<(), ConfigError> {
        let (head_id, head) = self.lookup(name)?;
        if !matches!(head.store, Store::Rules(_)) {
            return Err(ConfigError::NotARulePredicate(name.to_string()));
        }
        if clause.params.len() != head.signature.len() {
            return Err(ConfigError::ArityMismatch {
                predicate: name.to_string(),
                expected: head.signature.len(),
                found: clause.params.len(),
            });
        }
        let head_signature = head.signature.clone();

        // One type per name across the whole chain, seeded by the
        // parameter list. A repeated parameter name must repeat its type.
        let mut chain: IndexMap<&str, ValueType> = IndexMap::new();
        for (param, &ty) in clause.params.iter().zip(&head_signature) {
            if *chain.entry(param.as_str()).or_insert(ty) != ty {
                return Err(ConfigError::TypeConflict(param.clone()));
            }
        }

        let mut body = Vec::with_capacity(clause.body.len());
        for goal in &clause.body {
            let (target_id, target) = self.lookup(&goal.predicate)?;
            if goal.terms.len() != target.signature.len() {
                return Err(ConfigError::ArityMismatch {
                    predicate: goal.predicate.clone(),
                    expected: target.signature.len(),
                    found: goal.terms.len(),
                });
            }
            for (position, (term, &ty)) in goal.terms.iter().zip(&target.signature).enumerate() {
                match term {
                    Term::Lit(value) => {
                        if value.value_type() != ty {
                            return Err(ConfigError::ValueTypeMismatch {
                                predicate: goal.predicate.clone(),
                                position,
                                expected: ty,
                                found: value.value_type(),
                            });
                        }
                    }
                    Term::Var(var) => match chain.get(var.as_str()) {
                        Some(&seen) => {
                            if seen != ty {
                                return Err(ConfigError::TypeConflict(var.clone()));
                            }
                        }
                        None => {
                            if goal.polarity == Polarity::Negative {
                                return Err(ConfigError::NegationIntroducesVariable {
                                    predicate: goal.predicate.clone(),
                                    variable: var.clone(),
                                });
                            }
                            chain.insert(var.as_str(), ty);
                        }
                    },
                }
            }
            body.push(CompiledSubgoal {
                polarity: goal.polarity,
                target: target_id,
                terms: goal.terms.clone(),
            });
        }

        let (_, predicate) = self
            .predicates
            .get_index_mut(head_id)
            .expect("predicate ids are registry indexes");
        let Store::Rules(clauses) = &mut predicate.store else {
            unreachable!("store kind checked above");
        };
        clauses.push(CompiledClause {
            params: clause.params,
            body,
        });
        debug!("registered clause {} for rule `{name}`", clauses.len());
        Ok(())
    }

    /// Build a query against a predicate. Each argument is either a
    /// literal (a pre-bound constant) or a named unknown; repeating an
    /// unknown name aliases those positions to a single variable.
    ///
    /// # Errors
    ///
    /// Fails if the predicate is unknown, the arity or a literal type does
    /// not match, or an unknown name is repeated at two different types.
    pub fn create_query(&self, name: &str, args: Vec<Term>) -> Result<Query<'_>, ConfigError> {
        let (predicate, entry) = self.lookup(name)?;
        if args.len() != entry.signature.len() {
            return Err(ConfigError::ArityMismatch {
                predicate: name.to_string(),
                expected: entry.signature.len(),
                found: args.len(),
            });
        }
        let mut chain: IndexMap<&str, ValueType> = IndexMap::new();
        for (position, (term, &ty)) in args.iter().zip(&entry.signature).enumerate() {
            match term {
                Term::Lit(value) => {
                    if value.value_type() != ty {
                        return Err(ConfigError::ValueTypeMismatch {
                            predicate: name.to_string(),
                            position,
                            expected: ty,
                            found: value.value_type(),
                        });
                    }
                }
                Term::Var(var) => {
                    if *chain.entry(var.as_str()).or_insert(ty) != ty {
                        return Err(ConfigError::TypeConflict(var.clone()));
                    }
                }
            }
        }
        let unknowns = chain.keys().map(|&unknown| unknown.to_string()).collect();
        Ok(Query {
            db: self,
            predicate,
            args,
            unknowns,
        })
    }

    /// Resolve one predicate call.
    ///
    /// A ground call (every argument cell bound) can produce at most one
    /// observationally distinct solution, since no binding escapes it. A
    /// single continuation round-trip therefore settles the call and the
    /// remaining alternatives are skipped.
    fn solve(
        &self,
        cells: &mut CellArena,
        predicate: PredId,
        args: &[CellId],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        if args.iter().any(|&cell| !cells.is_bound(cell)) {
            return self.solve_alternatives(cells, predicate, args, next);
        }
        let mut hit = false;
        let mut resume = Control::Continue;
        self.solve_alternatives(cells, predicate, args, &mut |cells| {
            hit = true;
            resume = next(cells);
            Control::Stop
        });
        if hit {
            resume
        } else {
            Control::Continue
        }
    }

    fn solve_alternatives(
        &self,
        cells: &mut CellArena,
        predicate: PredId,
        args: &[CellId],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        let (_, entry) = self
            .predicates
            .get_index(predicate)
            .expect("predicate ids are registry indexes");
        match &entry.store {
            Store::Facts(tuples) => Self::solve_facts(cells, tuples, args, next),
            Store::Rules(clauses) => {
                for clause in clauses {
                    if self.solve_clause(cells, clause, args, next) == Control::Stop {
                        return Control::Stop;
                    }
                }
                Control::Continue
            }
            Store::Sum => Self::solve_sum(cells, args, next),
        }
    }

    /// Try every stored tuple against the argument cells: bound cells must
    /// equal the tuple's value, unbound cells take it. Whatever one tuple
    /// attempt bound is unbound, newest first, before the next attempt.
    fn solve_facts(
        cells: &mut CellArena,
        tuples: &IndexSet<Vec<Value>>,
        args: &[CellId],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        for tuple in tuples {
            let mut bound: SmallVec<[CellId; 4]> = SmallVec::new();
            let mut matched = true;
            for (&cell, value) in args.iter().zip(tuple) {
                if cells.is_bound(cell) {
                    if cells.value(cell) != value {
                        matched = false;
                        break;
                    }
                } else {
                    cells.bind(cell, value.clone());
                    bound.push(cell);
                }
            }
            let flow = if matched {
                next(cells)
            } else {
                Control::Continue
            };
            for &cell in bound.iter().rev() {
                cells.unbind(cell);
            }
            if flow == Control::Stop {
                return Control::Stop;
            }
        }
        Control::Continue
    }

    /// Enter one clause: alias its parameter names onto the caller's
    /// argument cells, then walk the body.
    ///
    /// A repeated parameter name reconciles the caller cells it spans: two
    /// bound cells must agree (else the clause is skipped without any
    /// search), a bound/unbound pair seeds the unbound cell, and a fully
    /// unbound pair is mirrored once the body completes.
    fn solve_clause(
        &self,
        cells: &mut CellArena,
        clause: &CompiledClause,
        args: &[CellId],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        let mut frame: Vec<ScopeVar<'_>> = Vec::with_capacity(clause.params.len());
        let mut seeded: SmallVec<[CellId; 2]> = SmallVec::new();
        let mut mirrors: SmallVec<[(CellId, CellId); 2]> = SmallVec::new();
        for (param, &cell) in clause.params.iter().zip(args) {
            let known = frame
                .iter()
                .find(|var| var.name == param.as_str())
                .map(|var| var.cell);
            match known {
                None => frame.push(ScopeVar {
                    name: param.as_str(),
                    cell,
                }),
                Some(primary) if primary == cell => {}
                Some(primary) => match (cells.is_bound(primary), cells.is_bound(cell)) {
                    (true, true) => {
                        if cells.value(primary) != cells.value(cell) {
                            for &seed in seeded.iter().rev() {
                                cells.unbind(seed);
                            }
                            return Control::Continue;
                        }
                    }
                    (true, false) => {
                        let value = cells.value(primary).clone();
                        cells.bind(cell, value);
                        seeded.push(cell);
                    }
                    (false, true) => {
                        let value = cells.value(cell).clone();
                        cells.bind(primary, value);
                        seeded.push(primary);
                    }
                    (false, false) => mirrors.push((primary, cell)),
                },
            }
        }
        let scope = Scope {
            parent: None,
            vars: frame,
        };
        let flow = self.solve_body(cells, &scope, &clause.body, &mirrors, next);
        for &seed in seeded.iter().rev() {
            cells.unbind(seed);
        }
        flow
    }

    /// Walk a clause body one subgoal at a time, in continuation-passing
    /// style: solving a positive subgoal continues into the rest of the
    /// body, and an empty body reaches the caller's continuation.
    fn solve_body<'a>(
        &'a self,
        cells: &mut CellArena,
        scope: &'a Scope<'a>,
        body: &'a [CompiledSubgoal],
        mirrors: &'a [(CellId, CellId)],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        let Some((goal, rest)) = body.split_first() else {
            // End of the body: duplicate parameters that entered fully
            // unbound mirror the primary's binding for the duration of the
            // continuation.
            let mut bound: SmallVec<[CellId; 2]> = SmallVec::new();
            for &(primary, duplicate) in mirrors {
                if cells.is_bound(primary) && !cells.is_bound(duplicate) {
                    let value = cells.value(primary).clone();
                    cells.bind(duplicate, value);
                    bound.push(duplicate);
                }
            }
            let flow = next(cells);
            for &cell in bound.iter().rev() {
                cells.unbind(cell);
            }
            return flow;
        };

        match goal.polarity {
            Polarity::Positive => {
                let mark = cells.len();
                let mut fresh: Vec<ScopeVar<'_>> = Vec::new();
                let mut call: SmallVec<[CellId; 4]> = SmallVec::new();
                for term in &goal.terms {
                    match term {
                        Term::Lit(value) => call.push(cells.push_constant(value.clone())),
                        Term::Var(name) => {
                            let existing = fresh
                                .iter()
                                .find(|var| var.name == name.as_str())
                                .map(|var| var.cell)
                                .or_else(|| scope.resolve(name));
                            let cell = match existing {
                                Some(cell) => cell,
                                None => {
                                    let cell = cells.push_variable();
                                    fresh.push(ScopeVar {
                                        name: name.as_str(),
                                        cell,
                                    });
                                    cell
                                }
                            };
                            call.push(cell);
                        }
                    }
                }
                let child = Scope {
                    parent: Some(scope),
                    vars: fresh,
                };
                let flow = self.solve(cells, goal.target, &call, &mut |cells| {
                    self.solve_body(cells, &child, rest, mirrors, &mut *next)
                });
                cells.truncate(mark);
                flow
            }
            Polarity::Negative => {
                let mark = cells.len();
                let mut call: SmallVec<[CellId; 4]> = SmallVec::new();
                for term in &goal.terms {
                    match term {
                        Term::Lit(value) => call.push(cells.push_constant(value.clone())),
                        Term::Var(name) => call.push(
                            scope
                                .resolve(name)
                                .expect("negated variables are checked at registration"),
                        ),
                    }
                }
                let mut found = false;
                self.solve(cells, goal.target, &call, &mut |_| {
                    found = true;
                    Control::Stop
                });
                cells.truncate(mark);
                if found {
                    Control::Continue
                } else {
                    self.solve_body(cells, scope, rest, mirrors, &mut *next)
                }
            }
        }
    }

    /// The additive builtin: `a = b + c`, with exactly one unbound
    /// argument computed from the other two. Overflow is a unification
    /// failure, not a panic.
    fn solve_sum(
        cells: &mut CellArena,
        args: &[CellId],
        next: &mut dyn FnMut(&mut CellArena) -> Control,
    ) -> Control {
        fn read(cells: &CellArena, cell: CellId) -> i64 {
            match cells.value(cell) {
                Value::Int(n) => *n,
                Value::Sym(_) => unreachable!("sum arguments are typed Int at configuration"),
            }
        }
        fn bind_and_continue(
            cells: &mut CellArena,
            cell: CellId,
            value: Option<i64>,
            next: &mut dyn FnMut(&mut CellArena) -> Control,
        ) -> Control {
            let Some(value) = value else {
                return Control::Continue;
            };
            cells.bind(cell, Value::Int(value));
            let flow = next(cells);
            cells.unbind(cell);
            flow
        }

        let (a, b, c) = (args[0], args[1], args[2]);
        match (cells.is_bound(a), cells.is_bound(b), cells.is_bound(c)) {
            (true, true, true) => {
                if read(cells, b).checked_add(read(cells, c)) == Some(read(cells, a)) {
                    next(cells)
                } else {
                    Control::Continue
                }
            }
            (false, true, true) => {
                let value = read(cells, b).checked_add(read(cells, c));
                bind_and_continue(cells, a, value, next)
            }
            (true, false, true) => {
                let value = read(cells, a).checked_sub(read(cells, c));
                bind_and_continue(cells, b, value, next)
            }
            (true, true, false) => {
                let value = read(cells, a).checked_sub(read(cells, b));
                bind_and_continue(cells, c, value, next)
            }
            _ => Control::Continue,
        }
    }
}

/// A prepared call against one predicate: literal arguments and named
/// unknowns, reusable across runs. Built by [`Database::create_query`].
#[derive(Debug)]
pub struct Query<'db> {
    db: &'db Database,
    predicate: PredId,
    args: Vec<Term>,
    unknowns: Vec<String>,
}

impl Query<'_> {
    /// The distinct unknown names of this query, in first-occurrence
    /// order. Solution rows passed to the callback follow this order.
    #[must_use]
    pub fn unknowns(&self) -> &[String] {
        &self.unknowns
    }

    /// Run the query, invoking `on_solution` with the bound values of the
    /// distinct unknowns for every solution found, and return the number
    /// of solutions. The callback decides whether the search keeps going
    /// ([`Control::Continue`]) or unwinds ([`Control::Stop`]).
    ///
    /// Each run builds a fresh set of binding cells, so a query can be
    /// solved any number of times, also interleaved with fact mutation
    /// between runs.
    ///
    /// # Panics
    ///
    /// Panics if a solution leaves a named unknown unbound, i.e. a rule
    /// head parameter that no clause body ever binds.
    pub fn solve<F>(&self, mut on_solution: F) -> usize
    where
        F: FnMut(&[Value]) -> Control,
    {
        let mut cells = CellArena::default();
        let mut named: SmallVec<[(&str, CellId); 4]> = SmallVec::new();
        let mut args: SmallVec<[CellId; 4]> = SmallVec::new();
        for term in &self.args {
            match term {
                Term::Lit(value) => args.push(cells.push_constant(value.clone())),
                Term::Var(name) => {
                    let existing = named
                        .iter()
                        .find(|(known, _)| *known == name.as_str())
                        .map(|&(_, cell)| cell);
                    let cell = match existing {
                        Some(cell) => cell,
                        None => {
                            let cell = cells.push_variable();
                            named.push((name.as_str(), cell));
                            cell
                        }
                    };
                    args.push(cell);
                }
            }
        }

        let mut count = 0usize;
        let mut row: Vec<Value> = Vec::with_capacity(named.len());
        self.db
            .solve(&mut cells, self.predicate, &args, &mut |cells| {
                row.clear();
                row.extend(named.iter().map(|&(_, cell)| cells.value(cell).clone()));
                count += 1;
                on_solution(&row)
            });
        let (name, _) = self
            .db
            .predicates
            .get_index(self.predicate)
            .expect("predicate ids are registry indexes");
        debug!("query on `{name}` produced {count} solution(s)");
        count
    }

    /// Whether the query has at least one solution. Stops at the first.
    #[must_use]
    pub fn ask(&self) -> bool {
        self.solve(|_| Control::Stop) > 0
    }
}
