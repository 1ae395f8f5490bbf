//! Reservation management
//!
//! [`Manager`] is the single entry point for requests: one mutex serializes
//! everything and routes to the per-interface [`InterfaceManager`], created
//! lazily on first use. The interface manager owns the mapping, the
//! scheduler and the set of configured VLANs, and runs each reservation as
//! an atomic unit: every partial failure restores the internal state to what
//! it was before the call.
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use nix::time::{clock_gettime, ClockId};

use detd_core::device::Device;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};
use detd_core::mapping::Mapping;
use detd_core::scheduler::{ScheduledTraffic, Scheduler};
use detd_core::stream::{Configuration, Hints, InterfaceConfiguration, ListenerConfiguration};

use crate::systemconf::{SystemConfigurator, SystemInformation};

/// What a client needs in order to use its reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDetails {
    pub vlan_interface: String,
    pub socket_priority: u32,
    /// Transmit window bounds with the hardware latency deducted, ns
    pub txoffset_min: u64,
    pub txoffset_max: u64,
}

/// A kernel interface bound to exactly one controller record
pub struct Interface {
    pub name: String,
    pub device: Device,
}

impl Interface {
    fn new(name: &str, sysinfo: &dyn SystemInformation) -> TypedResult<Self> {
        if !sysinfo.is_interface(name) {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Interface {name} does not exist"),
            ));
        }

        let pci_id = sysinfo.get_pci_id(name)?;
        let device = Device::from_pci_id(&pci_id)?;

        Ok(Self {
            name: name.to_string(),
            device,
        })
    }
}

/// Global request router. All operations serialize on one mutex; the
/// critical path is microseconds and requests arrive at application pace.
pub struct Manager {
    runner: Arc<dyn SystemConfigurator>,
    sysinfo: Arc<dyn SystemInformation>,
    interfaces: Mutex<HashMap<String, InterfaceManager>>,
}

impl Manager {
    pub fn new(runner: Arc<dyn SystemConfigurator>, sysinfo: Arc<dyn SystemInformation>) -> Self {
        Self {
            runner,
            sysinfo,
            interfaces: Mutex::new(HashMap::new()),
        }
    }

    fn with_interface<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut InterfaceManager) -> TypedResult<T>,
    ) -> TypedResult<T> {
        let mut interfaces = self
            .interfaces
            .lock()
            .map_err(|_| {
                TypedError::new(
                    SystemError::Service,
                    anyhow!("Manager mutex poisoned by an earlier panic"),
                )
            })?;

        let manager = match interfaces.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let interface = Interface::new(name, self.sysinfo.as_ref())?;
                entry.insert(InterfaceManager::new(
                    interface,
                    self.runner.clone(),
                    self.sysinfo.clone(),
                ))
            }
        };

        f(manager)
    }

    pub fn init_interface(&self, config: &InterfaceConfiguration) -> TypedResult<()> {
        self.with_interface(&config.interface, |m| m.init(config.hints))
    }

    pub fn add_talker(&self, config: &Configuration) -> TypedResult<StreamDetails> {
        self.with_interface(&config.interface, |m| m.add_talker(config))
    }

    pub fn add_listener(&self, config: &ListenerConfiguration) -> TypedResult<StreamDetails> {
        self.with_interface(&config.interface, |m| m.add_listener(config))
    }
}

/// Per-interface reservation state and transaction driver
struct InterfaceManager {
    interface: Interface,
    mapping: Mapping,
    scheduler: Scheduler,
    /// VLAN sub-interfaces are created at most once per VID
    vlans: HashSet<u16>,
    hints: Option<Hints>,
    runner: Arc<dyn SystemConfigurator>,
    sysinfo: Arc<dyn SystemInformation>,
}

impl InterfaceManager {
    fn new(
        interface: Interface,
        runner: Arc<dyn SystemConfigurator>,
        sysinfo: Arc<dyn SystemInformation>,
    ) -> Self {
        info!("Initializing InterfaceManager for {}", interface.name);

        let mapping = Mapping::new(interface.device.num_tx_queues());

        Self {
            interface,
            mapping,
            scheduler: Scheduler::new(),
            vlans: HashSet::new(),
            hints: None,
            runner,
            sysinfo,
        }
    }

    /// Pre-configures the interface and pins its hints before any stream
    /// arrives.
    fn init(&mut self, hints: Option<Hints>) -> TypedResult<()> {
        if let Some(hints) = &hints {
            self.interface.device.check_hints(hints)?;
        }

        self.runner
            .setup_device(&self.interface.name, &self.interface.device, hints.as_ref())?;
        self.hints = hints;

        Ok(())
    }

    /// Performs the local configuration for a talker stream and returns the
    /// VLAN interface and socket priority the application must use.
    fn add_talker(&mut self, config: &Configuration) -> TypedResult<StreamDetails> {
        let hints = config.hints.or(self.hints);
        if let Some(hints) = &hints {
            self.interface.device.check_hints(hints)?;
        }

        if !matches!(self.sysinfo.has_link(&self.interface.name), Ok(true)) {
            return Err(TypedError::new(
                SystemError::LinkDown,
                anyhow!("No link on {}", self.interface.name),
            ));
        }
        let rate = self.sysinfo.get_rate(&self.interface.name)?;

        let (soprio, tc, queue) = self.mapping.assign_and_map()?;

        let traffic = match ScheduledTraffic::new(config, rate, tc) {
            Ok(traffic) => traffic,
            Err(e) => {
                self.rollback_mapping(soprio, tc, queue);
                return Err(e);
            }
        };

        if let Err(e) = self.scheduler.add(traffic.clone()) {
            self.rollback_mapping(soprio, tc, queue);
            return Err(e);
        }

        if !self
            .interface
            .device
            .supports_schedule(self.scheduler.schedule())
        {
            self.rollback_traffic(&traffic);
            self.rollback_mapping(soprio, tc, queue);
            return Err(TypedError::new(
                SystemError::DeviceUnsupported,
                anyhow!(
                    "Device of {} cannot implement the resulting schedule",
                    self.interface.name
                ),
            ));
        }

        let base_time = match config.stream.base_time {
            Some(base_time) => base_time,
            None => {
                match compute_base_time(&self.interface.device, config.traffic.interval) {
                    Ok(base_time) => base_time,
                    Err(e) => {
                        self.rollback_traffic(&traffic);
                        self.rollback_mapping(soprio, tc, queue);
                        return Err(e);
                    }
                }
            }
        };

        let offload = hints.map(|h| h.tx_selection_offload).unwrap_or(true);
        let vid = config.stream.vid;
        let new_vlan = !self.vlans.contains(&vid);

        if let Err(e) = self.apply_talker(base_time, offload, vid, new_vlan, hints.as_ref()) {
            self.rollback_traffic(&traffic);
            self.rollback_mapping(soprio, tc, queue);
            return Err(e);
        }
        if new_vlan {
            self.vlans.insert(vid);
        }

        let device = &self.interface.device;
        Ok(StreamDetails {
            vlan_interface: format!("{}.{}", self.interface.name, vid),
            socket_priority: soprio,
            txoffset_min: config
                .stream
                .txoffset
                .saturating_sub(device.hardware_latency_max()),
            txoffset_max: config
                .stream
                .txoffset
                .saturating_sub(device.hardware_latency_min()),
        })
    }

    /// Reserves ingress resources for a listener stream. The gate schedule
    /// orders egress traffic only, so the scheduler stays untouched.
    fn add_listener(&mut self, config: &ListenerConfiguration) -> TypedResult<StreamDetails> {
        let hints = config.hints.or(self.hints);
        if let Some(hints) = &hints {
            self.interface.device.check_hints(hints)?;
        }

        let (soprio, tc, queue) = self.mapping.assign_and_map()?;

        let vid = config.stream.vid;
        let new_vlan = !self.vlans.contains(&vid);

        if let Err(e) = self.apply_listener(vid, new_vlan, hints.as_ref()) {
            self.rollback_mapping(soprio, tc, queue);
            return Err(e);
        }
        if new_vlan {
            self.vlans.insert(vid);
        }

        Ok(StreamDetails {
            vlan_interface: format!("{}.{}", self.interface.name, vid),
            socket_priority: soprio,
            txoffset_min: config.stream.txoffset,
            txoffset_max: config.stream.txoffset,
        })
    }

    /// External effects for a talker, in the fixed order device, qdisc,
    /// vlan. A failure reverses the steps already applied; if the reversal
    /// itself fails the error escalates to SystemInconsistent.
    fn apply_talker(
        &self,
        base_time: u64,
        offload: bool,
        vid: u16,
        new_vlan: bool,
        hints: Option<&Hints>,
    ) -> TypedResult<()> {
        let name = &self.interface.name;

        self.runner
            .setup_device(name, &self.interface.device, hints)?;

        // Device toggles are idempotent and need no reversal
        self.runner.setup_qdisc(
            name,
            &self.mapping,
            self.scheduler.schedule(),
            base_time,
            offload,
        )?;

        if new_vlan {
            if let Err(e) = self.runner.setup_vlan(name, vid, &self.mapping) {
                if let Err(revert) = self.runner.unset_qdisc(name) {
                    error!("Reverting qdisc on {name} failed: {revert}");
                    return Err(TypedError::new(
                        SystemError::SystemInconsistent,
                        anyhow!("VLAN setup and qdisc revert both failed on {name}: {e}"),
                    ));
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn apply_listener(&self, vid: u16, new_vlan: bool, hints: Option<&Hints>) -> TypedResult<()> {
        let name = &self.interface.name;

        self.runner
            .setup_device(name, &self.interface.device, hints)?;

        if new_vlan {
            self.runner.setup_vlan(name, vid, &self.mapping)?;
        }

        Ok(())
    }

    fn rollback_traffic(&mut self, traffic: &ScheduledTraffic) {
        if let Err(e) = self.scheduler.remove(traffic) {
            // Unreachable as long as the transaction only removes what it
            // added; not worth crashing the daemon over
            error!("Scheduler rollback failed: {e}");
        }
    }

    fn rollback_mapping(&mut self, soprio: u32, tc: u8, queue: u8) {
        if let Err(e) = self.mapping.unmap_and_free(soprio, tc, queue) {
            error!("Mapping rollback failed: {e}");
        }
    }
}

/// Start of the first cycle: the upcoming interval boundary, shifted by the
/// device-specific number of cycles (negative means a base time in the
/// past).
fn compute_base_time(device: &Device, interval: u64) -> TypedResult<u64> {
    let now = clock_gettime(ClockId::CLOCK_TAI).typ(SystemError::Service)?;
    let now = now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64;

    let ns_to_next_cycle = interval - (now % interval);
    let margin = device.base_time_multiple() * interval as i64;

    (now + ns_to_next_cycle)
        .checked_add_signed(margin)
        .ok_or_else(|| {
            TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Base time computation overflows for interval {interval}"),
            )
        })
}
