pub mod lbot;

pub use crate::lbot::*;
