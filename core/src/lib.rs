#[macro_use]
extern crate log;

pub mod check;
pub mod device;
pub mod error;
pub mod ipc;
pub mod mapping;
pub mod scheduler;
pub mod stream;
