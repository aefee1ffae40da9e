//! Traffic policy: domain and route rules plus content scanning
//!
//! The rule table and secret patterns are compiled together into one
//! immutable snapshot held by [`PolicyStore`]. A reload compiles a new
//! snapshot and swaps it in atomically.

pub mod domain;
pub mod evaluator;
pub mod store;

pub use domain::{
    default_domain_rules, default_route_rules, DomainRule, HeaderExemption, HostPattern,
    RouteRule, RuleAction, RuleMatch, RuleTable,
};
pub use evaluator::TrafficPolicy;
pub use store::{PolicySnapshot, PolicyStore};
