//! Protocol module - stage2 command protocol definitions.

pub mod ack;
pub mod constants;
pub mod frame;

pub use ack::Ack;
pub use constants::*;
pub use frame::{Frame, FrameError, Param};
