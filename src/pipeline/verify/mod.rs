//! Verifier (C3): three independent checks per field, consensus scoring,
//! and the deterministic rule predicates behind the third check.

pub mod checks;
pub mod consensus;

pub use self::consensus::{verify_document, Agreement, Check, CheckSource, Consensus, VerifiedDoc};
