//! ethtool command invocations
//!
//! Builds the argument vectors for the ethtool calls the service needs and
//! runs them. Builders are separate from execution so tests can assert the
//! exact command lines.
use std::process::Command;

use anyhow::anyhow;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};

pub struct CommandEthtool;

impl CommandEthtool {
    fn run(args: Vec<String>) -> TypedResult<()> {
        debug!("Running: ethtool {}", args.join(" "));

        let output = Command::new("ethtool")
            .args(&args)
            .output()
            .typ(SystemError::SystemConfigFailed)?;

        // ethtool returns 80 when the configuration does not change, treat
        // that the same as success
        if !matches!(output.status.code(), Some(0) | Some(80)) {
            return Err(TypedError::new(
                SystemError::SystemConfigFailed,
                anyhow!(
                    "ethtool {} failed: {} {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    pub fn set_eee(interface: &str, on: bool) -> TypedResult<()> {
        Self::run(set_eee_args(interface, on))
    }

    pub fn set_features(interface: &str, features: &[(&str, &str)]) -> TypedResult<()> {
        Self::run(set_features_args(interface, features))
    }

    pub fn set_split_channels(interface: &str, tx: u8, rx: u8) -> TypedResult<()> {
        Self::run(set_split_channels_args(interface, tx, rx))
    }

    pub fn set_combined_channels(interface: &str, queues: u8) -> TypedResult<()> {
        Self::run(set_combined_channels_args(interface, queues))
    }

    pub fn set_rings(interface: &str, tx_entries: u32, rx_entries: u32) -> TypedResult<()> {
        Self::run(set_rings_args(interface, tx_entries, rx_entries))
    }
}

fn set_eee_args(interface: &str, on: bool) -> Vec<String> {
    let eee = if on { "on" } else { "off" };
    vec![
        "--set-eee".into(),
        interface.into(),
        "eee".into(),
        eee.into(),
    ]
}

fn set_features_args(interface: &str, features: &[(&str, &str)]) -> Vec<String> {
    let mut args = vec!["--features".to_string(), interface.to_string()];
    for (feature, value) in features {
        args.push((*feature).into());
        args.push((*value).into());
    }

    args
}

fn set_split_channels_args(interface: &str, tx: u8, rx: u8) -> Vec<String> {
    vec![
        "--set-channels".into(),
        interface.into(),
        "tx".into(),
        tx.to_string(),
        "rx".into(),
        rx.to_string(),
    ]
}

fn set_combined_channels_args(interface: &str, queues: u8) -> Vec<String> {
    vec![
        "--set-channels".into(),
        interface.into(),
        "combined".into(),
        queues.to_string(),
    ]
}

/// Each ring entry holds one SKB descriptor.
fn set_rings_args(interface: &str, tx_entries: u32, rx_entries: u32) -> Vec<String> {
    vec![
        "--set-ring".into(),
        interface.into(),
        "tx".into(),
        tx_entries.to_string(),
        "rx".into(),
        rx_entries.to_string(),
    ]
}
