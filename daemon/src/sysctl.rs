//! sysctl command invocations
use std::process::Command;

use anyhow::anyhow;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};

pub struct CommandSysctl;

impl CommandSysctl {
    fn run(args: Vec<String>) -> TypedResult<()> {
        debug!("Running: sysctl {}", args.join(" "));

        let output = Command::new("sysctl")
            .args(&args)
            .output()
            .typ(SystemError::SystemConfigFailed)?;

        if !output.status.success() {
            return Err(TypedError::new(
                SystemError::SystemConfigFailed,
                anyhow!(
                    "sysctl {} failed: {} {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    /// Keeps IPv6 chatter (router solicitations, MLD) away from the
    /// scheduled queues of the interface or one of its VLANs.
    pub fn disable_ipv6(interface: &str, vid: Option<u16>) -> TypedResult<()> {
        Self::run(disable_ipv6_args(interface, vid))
    }
}

fn disable_ipv6_args(interface: &str, vid: Option<u16>) -> Vec<String> {
    // sysctl spells a VLAN interface "eth0/3", not "eth0.3"
    let name = match vid {
        Some(vid) => format!("{interface}/{vid}"),
        None => interface.to_string(),
    };

    vec![
        "-w".into(),
        format!("net.ipv6.conf.{name}.disable_ipv6=1"),
    ]
}
