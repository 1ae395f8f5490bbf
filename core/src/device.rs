//! Registry of supported TSN Ethernet controllers
//!
//! Each supported controller family contributes one [`DeviceModel`] variant
//! together with a static capability record. Matching is done on the PCI
//! vendor:device string as read from sysfs; unknown hardware is rejected so
//! that the daemon never guesses queue counts or scheduling constraints.
use anyhow::anyhow;

use crate::error::{SystemError, TypedError, TypedResult};
use crate::scheduler::Schedule;
use crate::stream::{Hints, TxSelection};

/// Hardware features relevant to deterministic transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// 802.1Qbv time aware gate scheduling
    GateSchedule,
    /// 802.1Qbu/802.3br frame preemption
    FramePreemption,
    /// Per-frame launch time control (SO_TXTIME offload)
    LaunchTimeControl,
}

/// Supported controller families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    /// Integrated Intel mGBE controller on the Elkhart Lake platform,
    /// host and PSE instances
    IntelMgbeEhl,
    IntelI210,
    IntelI225,
    IntelI226,
}

// Elkhart Lake host and PSE instances
const PCI_IDS_MGBE_EHL: &[&str] = &[
    "8086:4B30", "8086:4B31", "8086:4B32",
    "8086:4BA0", "8086:4BA1", "8086:4BA2",
    "8086:4BB0", "8086:4BB1", "8086:4BB2",
];

const PCI_IDS_I210: &[&str] = &[
    "8086:1533", "8086:1536", "8086:1537", "8086:1538",
    "8086:157B", "8086:157C", "8086:15F6",
];

// i210 with an empty flash image, or NVM configuration loading failed
const PCI_IDS_I210_UNPROGRAMMED: &[&str] = &["8086:1531"];

// i225-LM, i225-IT
const PCI_IDS_I225: &[&str] = &["8086:0D9F", "8086:15F2"];

// i225-V and i225-LMvP do not support TSN
const PCI_IDS_I225_NON_TSN: &[&str] = &["8086:15F3", "8086:5502"];

const PCI_IDS_I225_UNPROGRAMMED: &[&str] = &["8086:15FD"];

// i226-LM, i226-IT
const PCI_IDS_I226: &[&str] = &["8086:125B", "8086:125D"];

const PCI_IDS_I226_UNPROGRAMMED: &[&str] = &["8086:125F"];

/// Capability record of one interface's controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    model: DeviceModel,
    num_tx_queues: u8,
    num_rx_queues: u8,
    capabilities: &'static [Capability],
    /// Minimum and maximum MAC plus PHY latency in ns
    hardware_latency_min: u64,
    hardware_latency_max: u64,
    num_tx_ring_entries: u32,
    num_rx_ring_entries: u32,
    /// ethtool feature toggles applied during interface setup
    features: &'static [(&'static str, &'static str)],
    supports_split_channels: bool,
    /// Cycles added to the start of the next cycle when deriving a base
    /// time; negative places the base time in the past
    base_time_multiple: i64,
}

impl Device {
    /// Matches a `vendor:device` PCI ID string against the known
    /// controllers.
    pub fn from_pci_id(pci_id: &str) -> TypedResult<Self> {
        let pci_id = pci_id.to_uppercase();
        let pci_id = pci_id.as_str();

        if PCI_IDS_MGBE_EHL.contains(&pci_id) {
            info!("Initializing device Intel mGBE (Elkhart Lake)");
            return Ok(Self {
                model: DeviceModel::IntelMgbeEhl,
                num_tx_queues: 8,
                num_rx_queues: 8,
                capabilities: &[
                    Capability::GateSchedule,
                    Capability::FramePreemption,
                    Capability::LaunchTimeControl,
                ],
                // Placeholder MAC+PHY latency
                hardware_latency_min: 1_000,
                hardware_latency_max: 2_000,
                num_tx_ring_entries: 1024,
                num_rx_ring_entries: 1024,
                features: &[("rxvlan", "off"), ("hw-tc-offload", "on")],
                supports_split_channels: true,
                base_time_multiple: 2,
            });
        }

        if PCI_IDS_I210.contains(&pci_id) {
            info!("Initializing device Intel i210");
            return Ok(Self {
                model: DeviceModel::IntelI210,
                num_tx_queues: 4,
                num_rx_queues: 4,
                capabilities: &[Capability::LaunchTimeControl],
                // MAC+PHY latency assuming a 100 Mbit link
                hardware_latency_min: 2_168,
                hardware_latency_max: 2_384,
                num_tx_ring_entries: 1024,
                num_rx_ring_entries: 1024,
                features: &[("rxvlan", "off")],
                supports_split_channels: false,
                base_time_multiple: -1,
            });
        }

        if PCI_IDS_I225.contains(&pci_id) {
            info!("Initializing device Intel i225");
            return Ok(Self {
                model: DeviceModel::IntelI225,
                num_tx_queues: 4,
                num_rx_queues: 4,
                capabilities: &[Capability::GateSchedule],
                // Placeholder MAC+PHY latency
                hardware_latency_min: 1_000,
                hardware_latency_max: 2_000,
                num_tx_ring_entries: 1024,
                num_rx_ring_entries: 1024,
                features: &[("rxvlan", "off")],
                supports_split_channels: false,
                base_time_multiple: -1,
            });
        }

        if PCI_IDS_I226.contains(&pci_id) {
            info!("Initializing device Intel i226");
            return Ok(Self {
                model: DeviceModel::IntelI226,
                num_tx_queues: 4,
                num_rx_queues: 4,
                capabilities: &[
                    Capability::GateSchedule,
                    Capability::FramePreemption,
                    Capability::LaunchTimeControl,
                ],
                // Placeholder MAC+PHY latency
                hardware_latency_min: 1_000,
                hardware_latency_max: 2_000,
                num_tx_ring_entries: 1024,
                num_rx_ring_entries: 1024,
                features: &[("rxvlan", "off")],
                supports_split_channels: false,
                base_time_multiple: -1,
            });
        }

        if PCI_IDS_I225_NON_TSN.contains(&pci_id) {
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!("This i225 device does not support TSN"),
            ));
        }

        if PCI_IDS_I210_UNPROGRAMMED.contains(&pci_id)
            || PCI_IDS_I225_UNPROGRAMMED.contains(&pci_id)
            || PCI_IDS_I226_UNPROGRAMMED.contains(&pci_id)
        {
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!(
                    "The flash image in this device is empty, or the NVM configuration loading failed"
                ),
            ));
        }

        Err(TypedError::new(
            SystemError::DeviceUnsupported,
            anyhow!("Unrecognized PCI ID: {pci_id}"),
        ))
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn num_tx_queues(&self) -> u8 {
        self.num_tx_queues
    }

    pub fn num_rx_queues(&self) -> u8 {
        self.num_rx_queues
    }

    pub fn num_tx_ring_entries(&self) -> u32 {
        self.num_tx_ring_entries
    }

    pub fn num_rx_ring_entries(&self) -> u32 {
        self.num_rx_ring_entries
    }

    pub fn features(&self) -> &'static [(&'static str, &'static str)] {
        self.features
    }

    pub fn supports_split_channels(&self) -> bool {
        self.supports_split_channels
    }

    pub fn base_time_multiple(&self) -> i64 {
        self.base_time_multiple
    }

    pub fn hardware_latency_min(&self) -> u64 {
        self.hardware_latency_min
    }

    pub fn hardware_latency_max(&self) -> u64 {
        self.hardware_latency_max
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether the controller can implement the schedule.
    ///
    /// This prevents setting up a schedule the hardware would silently
    /// mangle. It accounts for per-family limits, for example a gate that
    /// may open at most once per cycle.
    pub fn supports_schedule(&self, schedule: &Schedule) -> bool {
        match self.model {
            DeviceModel::IntelMgbeEhl => true,
            DeviceModel::IntelI210 => true,
            DeviceModel::IntelI225 => !schedule.opens_gate_multiple_times_per_cycle(),
            DeviceModel::IntelI226 => {
                if !schedule.opens_gate_multiple_times_per_cycle() {
                    return true;
                }
                // With queues assigned exclusively per slot, up to two
                // streams plus best effort fit within the four gate events
                // the controller can drive per cycle
                schedule.num_traffics() <= 3 && schedule.len() <= 4
            }
        }
    }

    /// Rejects hints that imply a capability this controller lacks.
    pub fn check_hints(&self, hints: &Hints) -> TypedResult<()> {
        if hints.tx_selection == TxSelection::Est
            && hints.tx_selection_offload
            && !self.has_capability(Capability::GateSchedule)
        {
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!("Device has no gate scheduling offload"),
            ));
        }

        if hints.preemption && !self.has_capability(Capability::FramePreemption) {
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!("Device has no frame preemption support"),
            ));
        }

        if hints.launch_time_control && !self.has_capability(Capability::LaunchTimeControl) {
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!("Device has no launch time control support"),
            ));
        }

        Ok(())
    }
}
