//! iproute2 ip command invocations for VLAN sub-interfaces
use std::collections::BTreeMap;
use std::process::Command;

use anyhow::anyhow;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};

pub struct CommandIp;

impl CommandIp {
    fn run(args: Vec<String>) -> TypedResult<()> {
        debug!("Running: ip {}", args.join(" "));

        let output = Command::new("ip")
            .args(&args)
            .output()
            .typ(SystemError::SystemConfigFailed)?;

        if !output.status.success() {
            return Err(TypedError::new(
                SystemError::SystemConfigFailed,
                anyhow!(
                    "ip {} failed: {} {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    /// Creates the 802.1Q sub-interface `<interface>.<vid>` with the egress
    /// socket priority to PCP relation attached.
    pub fn set_vlan(
        interface: &str,
        vid: u16,
        soprio_to_pcp: &BTreeMap<u32, u8>,
    ) -> TypedResult<()> {
        Self::run(set_vlan_args(interface, vid, soprio_to_pcp))
    }

    pub fn unset_vlan(interface: &str, vid: u16) -> TypedResult<()> {
        Self::run(unset_vlan_args(interface, vid))
    }
}

fn set_vlan_args(interface: &str, vid: u16, soprio_to_pcp: &BTreeMap<u32, u8>) -> Vec<String> {
    let mut args: Vec<String> = [
        "link",
        "add",
        "link",
        interface,
        "name",
        &format!("{interface}.{vid}"),
        "type",
        "vlan",
        "protocol",
        "802.1Q",
        "id",
        &vid.to_string(),
        "egress-qos-map",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    for (soprio, pcp) in soprio_to_pcp {
        args.push(format!("{soprio}:{pcp}"));
    }

    args
}

fn unset_vlan_args(interface: &str, vid: u16) -> Vec<String> {
    vec![
        "link".into(),
        "delete".into(),
        format!("{interface}.{vid}"),
    ]
}
