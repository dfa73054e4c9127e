// Decision engine. Pure functions only: the workflow executes whatever
// plan comes out of here.

pub mod martingale;

pub use martingale::{decide, round_to_lot};
