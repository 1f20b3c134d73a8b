pub use std::collections::BTreeMap as Map;

pub mod biophys;
pub mod cell;
pub mod circuit;
pub mod edges;
pub mod err;
pub mod extract;
pub mod identity;
pub mod morph;
pub mod network;
pub mod node;
pub mod raw;
pub mod reductor;
pub mod simulator;
pub mod sup;
