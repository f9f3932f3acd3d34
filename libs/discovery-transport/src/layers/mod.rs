//! Request filters and the tower layer that applies them.
//!
//! Every request leaving a transport client passes through one
//! [`RequestFilterLayer`] whose chain starts with the [`UserAgentFilter`],
//! followed by the identity filter and caller-supplied filters.

mod filter;
mod user_agent;

pub use filter::{RequestFilter, RequestFilterLayer, RequestFilterService};
pub use user_agent::UserAgentFilter;
