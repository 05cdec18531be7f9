// src/core/protocol/mod.rs

//! The control-plane wire protocol: byte frames plus the typed message set.

pub mod frame;
pub mod messages;

pub use frame::{FrameCodec, WireFrame};
pub use messages::{ControlMessage, ServerRole, message_type_hash};
