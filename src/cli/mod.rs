pub mod command;
pub mod info;
pub mod packets;
pub mod remux;
