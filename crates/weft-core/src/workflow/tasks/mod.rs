//! Behaviors of the individual task kinds.
//!
//! Each behavior owns a copy of its kind's definition and implements
//! [`TaskBehavior`](super::executor::TaskBehavior). The factory picks one per
//! task instance.

pub mod call;
pub mod concurrent;
pub mod emit;
pub mod for_each;
pub mod listen;
pub mod raise;
pub mod sequential;
pub mod set;
pub mod switch;
pub mod try_catch;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;
