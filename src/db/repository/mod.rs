//! Repository layer: entity-scoped database operations.
//!
//! Functions take a `&Connection` so callers control transaction
//! boundaries; state changes and their audit events commit together.

mod booking;
mod export;
mod law;
mod memory;
mod session;

pub use self::booking::*;
pub use self::export::*;
pub use self::law::*;
pub use self::memory::*;
pub use self::session::*;
