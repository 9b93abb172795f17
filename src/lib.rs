//! # freshd
//!
//! Background daemon that keeps semantic-search indexes of registered code
//! repositories fresh. Change events feed a debounced queue; a tick-driven
//! scheduler turns them into lease-guarded index jobs; enrichment calls fan
//! out across rate-limited, circuit-protected backend tiers under daily and
//! monthly budget caps.

pub mod backends;
pub mod cascade;
pub mod change_queue;
pub mod config;
pub mod daemon;
pub mod doctor;
pub mod error;
pub mod processor;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod worker;
