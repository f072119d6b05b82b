//! Stock-counting domain types.
//!
//! Plain data plus local validation (no IO, no HTTP, no storage). The server
//! remains the authority; these types mirror its resource shapes so the
//! offline layer can cache them and build provisional local copies.

pub mod item;
pub mod session;

pub use item::Item;
pub use session::{
    CloseSession, CountLine, CountSession, NewCountLine, NewSession, NewUnknownItem,
    SessionStatus, UnknownItem,
};
