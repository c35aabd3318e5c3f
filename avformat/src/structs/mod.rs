//! Data structures shared by every container format.

pub mod encryption;
pub mod fourcc;
pub mod packet;
pub mod rational;
pub mod stream;
