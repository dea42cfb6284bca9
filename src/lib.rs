//! Local network control of the `zhimi.aircondition.ma1` air conditioner, presented as a climate
//! entity.

pub mod climate;
pub mod commands;
pub mod connection;
pub mod device;
pub mod miio;
pub mod output;
pub mod properties;
