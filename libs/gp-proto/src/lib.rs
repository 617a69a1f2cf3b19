#![cfg_attr(test, allow(clippy::unwrap_used, clippy::unwrap_in_result))]

pub mod challenge;
pub mod config;
pub mod frame;
pub mod response;

pub use config::{ConfigOption, TunnelConfig};
pub use frame::{Frame, FrameError, FrameKind, Header};
pub use response::{HttpError, ResponseError};
