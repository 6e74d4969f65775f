//! Control-link core for a hand-held TCP remote control.
//!
//! The crate has three areas: [`link`] owns the single TCP session to the
//! vehicle, [`dispatch`] turns operator input into the de-duplicated,
//! rate-limited command stream the embedded side can keep up with, and
//! [`persistence`] provides the settings store and command log the
//! surrounding shell wires in.

pub mod dispatch;
pub mod link;
pub mod persistence;
