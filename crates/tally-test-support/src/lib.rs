//! Shared test repositories and clocks for the Tally event store.

mod clock;
mod repository;

pub use clock::{FixedClock, fixed_time};
pub use repository::{FailingEventRepository, InMemoryEventRepository};
