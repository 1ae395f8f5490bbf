//! System-side effects behind narrow interfaces
//!
//! The reservation logic drives these two traits and never touches the
//! system directly. The Linux implementations shell out to ethtool, tc, ip
//! and sysctl and read sysfs; the no-op/canned pair backs the test mode.
use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use anyhow::anyhow;
use detd_core::device::Device;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};
use detd_core::mapping::Mapping;
use detd_core::scheduler::Schedule;
use detd_core::stream::Hints;

use crate::ethtool::CommandEthtool;
use crate::ip::CommandIp;
use crate::sysctl::CommandSysctl;
use crate::tc::CommandTc;

/// Read-only queries about interfaces and their hardware
pub trait SystemInformation: Send + Sync {
    fn is_interface(&self, name: &str) -> bool;
    /// PCI ID of the interface's controller as `VVVV:DDDD`
    fn get_pci_id(&self, name: &str) -> TypedResult<String>;
    /// Link rate in bits per second
    fn get_rate(&self, name: &str) -> TypedResult<u64>;
    fn has_link(&self, name: &str) -> TypedResult<bool>;
}

/// Mutations of kernel and device state.
///
/// The reservation logic calls these in the fixed order device, qdisc, vlan
/// and reverses on failure.
pub trait SystemConfigurator: Send + Sync {
    /// Device-level toggles: EEE off, feature flags, channels, ring sizes,
    /// IPv6 suppression on the parent interface
    fn setup_device(&self, interface: &str, device: &Device, hints: Option<&Hints>)
        -> TypedResult<()>;
    fn setup_qdisc(
        &self,
        interface: &str,
        mapping: &Mapping,
        schedule: &Schedule,
        base_time: u64,
        offload: bool,
    ) -> TypedResult<()>;
    fn unset_qdisc(&self, interface: &str) -> TypedResult<()>;
    fn setup_vlan(&self, interface: &str, vid: u16, mapping: &Mapping) -> TypedResult<()>;
    fn unset_vlan(&self, interface: &str, vid: u16) -> TypedResult<()>;
}

pub struct LinuxSystemInformation;

impl LinuxSystemInformation {
    fn read_sysfs(path: PathBuf) -> TypedResult<String> {
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Reading {} failed: {e}", path.display()))
            .typ(SystemError::Service)?;

        Ok(content.trim().to_string())
    }

    fn read_speed_mbps(name: &str) -> TypedResult<i64> {
        let path = PathBuf::from(format!("/sys/class/net/{name}/speed"));
        Self::read_sysfs(path)?
            .parse::<i64>()
            .map_err(|e| anyhow!("Unparseable link speed: {e}"))
            .typ(SystemError::LinkDown)
    }
}

impl SystemInformation for LinuxSystemInformation {
    fn is_interface(&self, name: &str) -> bool {
        match nix::net::if_::if_nameindex() {
            Ok(interfaces) => interfaces
                .iter()
                .any(|i| i.name().to_str() == Ok(name)),
            Err(_) => false,
        }
    }

    fn get_pci_id(&self, name: &str) -> TypedResult<String> {
        let vendor = Self::read_sysfs(PathBuf::from(format!(
            "/sys/class/net/{name}/device/vendor"
        )))?;
        let device = Self::read_sysfs(PathBuf::from(format!(
            "/sys/class/net/{name}/device/device"
        )))?;

        let vendor = vendor.trim_start_matches("0x").to_uppercase();
        let device = device.trim_start_matches("0x").to_uppercase();

        Ok(format!("{vendor}:{device}"))
    }

    fn get_rate(&self, name: &str) -> TypedResult<u64> {
        // The driver reports an unknown speed (-1) for a short while after
        // ethtool reconfiguration, so retry once after a beat
        let mut speed = Self::read_speed_mbps(name);
        if !matches!(speed, Ok(s) if s > 0) {
            sleep(Duration::from_secs(1));
            speed = Self::read_speed_mbps(name);
        }

        match speed {
            Ok(s) if s > 0 => Ok(s as u64 * 1_000_000),
            Ok(s) => Err(TypedError::new(
                SystemError::LinkDown,
                anyhow!("Interface {name} reports link speed {s}"),
            )),
            Err(e) => Err(e),
        }
    }

    fn has_link(&self, name: &str) -> TypedResult<bool> {
        let path = PathBuf::from(format!("/sys/class/net/{name}/carrier"));
        Ok(Self::read_sysfs(path)? == "1")
    }
}

pub struct LinuxSystemConfigurator;

impl SystemConfigurator for LinuxSystemConfigurator {
    fn setup_device(
        &self,
        interface: &str,
        device: &Device,
        _hints: Option<&Hints>,
    ) -> TypedResult<()> {
        info!("Configuring device for {interface}");

        CommandEthtool::set_eee(interface, false)?;
        CommandEthtool::set_features(interface, device.features())?;

        if device.supports_split_channels() {
            CommandEthtool::set_split_channels(
                interface,
                device.num_tx_queues(),
                device.num_rx_queues(),
            )?;
        } else {
            CommandEthtool::set_combined_channels(interface, device.num_tx_queues())?;
        }

        CommandEthtool::set_rings(
            interface,
            device.num_tx_ring_entries(),
            device.num_rx_ring_entries(),
        )?;

        CommandSysctl::disable_ipv6(interface, None)?;

        Ok(())
    }

    fn setup_qdisc(
        &self,
        interface: &str,
        mapping: &Mapping,
        schedule: &Schedule,
        base_time: u64,
        offload: bool,
    ) -> TypedResult<()> {
        info!("Installing taprio qdisc on {interface}");

        CommandTc::set_taprio(interface, mapping, schedule, base_time, offload)
    }

    fn unset_qdisc(&self, interface: &str) -> TypedResult<()> {
        CommandTc::unset_taprio(interface)
    }

    fn setup_vlan(&self, interface: &str, vid: u16, mapping: &Mapping) -> TypedResult<()> {
        info!("Creating VLAN interface {interface}.{vid}");

        CommandIp::set_vlan(interface, vid, mapping.soprio_to_pcp())?;
        CommandSysctl::disable_ipv6(interface, Some(vid))?;

        Ok(())
    }

    fn unset_vlan(&self, interface: &str, vid: u16) -> TypedResult<()> {
        CommandIp::unset_vlan(interface, vid)
    }
}

/// Stand-in for test mode: accepts every configuration without touching the
/// system.
pub struct NoopSystemConfigurator;

impl SystemConfigurator for NoopSystemConfigurator {
    fn setup_device(
        &self,
        _interface: &str,
        _device: &Device,
        _hints: Option<&Hints>,
    ) -> TypedResult<()> {
        Ok(())
    }

    fn setup_qdisc(
        &self,
        _interface: &str,
        _mapping: &Mapping,
        _schedule: &Schedule,
        _base_time: u64,
        _offload: bool,
    ) -> TypedResult<()> {
        Ok(())
    }

    fn unset_qdisc(&self, _interface: &str) -> TypedResult<()> {
        Ok(())
    }

    fn setup_vlan(&self, _interface: &str, _vid: u16, _mapping: &Mapping) -> TypedResult<()> {
        Ok(())
    }

    fn unset_vlan(&self, _interface: &str, _vid: u16) -> TypedResult<()> {
        Ok(())
    }
}

/// Canned answers for test mode, mimicking an Elkhart Lake port with link up
/// at 1 Gbps.
pub struct MockSystemInformation {
    pub pci_id: String,
    pub rate: u64,
}

impl Default for MockSystemInformation {
    fn default() -> Self {
        Self {
            pci_id: "8086:4B30".into(),
            rate: 1_000_000_000,
        }
    }
}

impl SystemInformation for MockSystemInformation {
    fn is_interface(&self, _name: &str) -> bool {
        true
    }

    fn get_pci_id(&self, _name: &str) -> TypedResult<String> {
        Ok(self.pci_id.clone())
    }

    fn get_rate(&self, _name: &str) -> TypedResult<u64> {
        Ok(self.rate)
    }

    fn has_link(&self, _name: &str) -> TypedResult<bool> {
        Ok(true)
    }
}
