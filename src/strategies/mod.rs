//! The four optimization engines. Each implements [`Strategy`](crate::optimizer::Strategy).

pub mod context_filter;
pub mod evolutionary;
pub mod induction;
pub mod iterative;

pub use context_filter::ContextFilterStrategy;
pub use evolutionary::{EvolutionaryStrategy, Unit};
pub use induction::{Example, InductionStrategy};
pub use iterative::IterativeStrategy;
