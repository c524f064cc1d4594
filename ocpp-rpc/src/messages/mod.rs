//! Typed action catalogue
//!
//! One module per protocol dialect. Each action is a marker type implementing
//! [`Action`](crate::Action), named exactly as on the wire.

pub mod v16;
pub mod v201;
