#[macro_use]
extern crate log;

pub mod ethtool;
pub mod ip;
pub mod manager;
pub mod service;
pub mod sysctl;
pub mod systemconf;
pub mod tc;

use detd_core::error::TypedResult;

use crate::service::Service;

/// Builds the service and serves requests until termination.
pub fn run_service() -> TypedResult<()> {
    let mut service = Service::new()?;
    service.run()
}
