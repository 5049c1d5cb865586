//! Process-wide configuration: a flat YAML-backed parameter store consulted
//! by the clock and available to node/plugin constructors (spec §6,
//! `SPEC_FULL.md` §4.10).

mod store;
mod value;

pub use store::{load, store, Store};
pub use value::ConfigValue;
