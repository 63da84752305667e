//! Shared protocol definitions for the gatebridge gateway wire format.

pub mod codec;
pub mod frame;
pub mod gateway;
