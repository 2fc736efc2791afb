//! Message Routing
//!
//! Decides, per inbound message, which route (destination template and
//! transform) applies. Routes are evaluated in descending priority; within
//! a route all filters must pass.

mod filter;
mod router;


pub use filter::Filter;
pub use router::{Route, Router};
