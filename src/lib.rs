//! htnlog - a Hierarchical Task Network planner fused with a Prolog-style
//! goal resolver.
//!
//! Given an initial world state (facts and rules), a domain (methods and
//! operators), and an ordered list of goal tasks, the planner produces
//! plans: ordered sequences of ground operator invocations, each with the
//! final world state it induces and a full decomposition tree recording
//! both successful and failed search branches.

pub mod arith;
pub mod domain;
pub mod metrics;
pub mod planner;
pub mod resolver;
pub mod rules;
pub mod subst;
pub mod symbol;
pub mod term;
pub mod trace;
pub mod tree;
pub mod unify;

pub use domain::{Domain, Method, MethodType, Operator};
pub use planner::{PlanDiagnostics, PlanState, Planner, Solution};
pub use resolver::{CaptureSink, OutputSink, ResolveResult, Resolver};
pub use rules::{Rule, RuleSet};
pub use subst::Bindings;
pub use term::{Term, TermId, TermStore};
pub use tree::DecompTreeNode;
pub use unify::unify;
