//! Persistent agent state.
//!
//! SQLite storage for target schedules and the agent identity.

mod models;
mod store;

pub use models::*;
pub use store::*;
