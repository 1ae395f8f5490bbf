//! Stream descriptions as submitted by talker and listener applications
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::check;
use crate::error::{SystemError, TypedError, TypedResult};

/// A 48 bit IEEE 802 MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl FromStr for MacAddress {
    type Err = TypedError;

    fn from_str(s: &str) -> TypedResult<Self> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(TypedError::new(
                    SystemError::InvalidArgument,
                    anyhow!("Invalid MAC address: {s}"),
                ));
            }
            octets[count] = u8::from_str_radix(part, 16).map_err(|_| {
                TypedError::new(
                    SystemError::InvalidArgument,
                    anyhow!("Invalid MAC address: {s}"),
                )
            })?;
            count += 1;
        }
        if count != 6 {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Invalid MAC address: {s}"),
            ));
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Transmission selection algorithm requested for an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxSelection {
    /// Enhancements for scheduled traffic (802.1Qbv time aware shaper)
    Est,
    /// Plain strict priority between traffic classes
    StrictPriority,
}

/// Packet I/O path the application intends to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPath {
    AfPacket,
    AfXdpZeroCopy,
}

/// Optional per-interface tuning requested by the application.
///
/// Each hint implies a device capability; requesting one the device lacks
/// fails the reservation instead of being silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    pub tx_selection: TxSelection,
    pub tx_selection_offload: bool,
    pub data_path: DataPath,
    pub preemption: bool,
    pub launch_time_control: bool,
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            tx_selection: TxSelection::Est,
            tx_selection_offload: true,
            data_path: DataPath::AfPacket,
            preemption: false,
            launch_time_control: false,
        }
    }
}

/// Layer-2 addressing and timing of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub addr: MacAddress,
    pub vid: u16,
    pub pcp: u8,
    /// Offset inside the cycle at which the frame is expected on the wire, ns
    pub txoffset: u64,
    /// Absolute TAI start of the first cycle; computed by the service when
    /// the application leaves it out
    pub base_time: Option<u64>,
}

impl StreamConfiguration {
    pub fn new(
        addr: MacAddress,
        vid: u16,
        pcp: u8,
        txoffset: u64,
        base_time: Option<u64>,
    ) -> TypedResult<Self> {
        if !check::is_valid_vlan_id(vid) {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Invalid VLAN ID {vid}"),
            ));
        }
        if !check::is_valid_pcp(pcp) {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Invalid VLAN PCP {pcp}"),
            ));
        }
        Ok(Self {
            addr,
            vid,
            pcp,
            txoffset,
            base_time,
        })
    }
}

/// Periodicity and frame size of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSpecification {
    /// Transmission interval in ns
    pub interval: u64,
    /// Frame size in bytes, including all headers
    pub size: u32,
}

impl TrafficSpecification {
    pub fn new(interval: u64, size: u32) -> TypedResult<Self> {
        if interval == 0 {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Invalid interval {interval}"),
            ));
        }
        if size == 0 {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("Invalid frame size {size}"),
            ));
        }
        Ok(Self { interval, size })
    }
}

/// A complete talker reservation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub interface: String,
    pub stream: StreamConfiguration,
    pub traffic: TrafficSpecification,
    pub hints: Option<Hints>,
}

impl Configuration {
    pub fn new(
        interface: String,
        stream: StreamConfiguration,
        traffic: TrafficSpecification,
        hints: Option<Hints>,
    ) -> TypedResult<Self> {
        // An offset equal to the interval aliases offset 0 of the next cycle
        if stream.txoffset >= traffic.interval {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!(
                    "Invalid TxOffset {}, it reaches the interval {}",
                    stream.txoffset,
                    traffic.interval
                ),
            ));
        }
        Ok(Self {
            interface,
            stream,
            traffic,
            hints,
        })
    }
}

/// A listener reservation: like a talker, plus the multicast address the
/// application will subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfiguration {
    pub interface: String,
    pub stream: StreamConfiguration,
    pub traffic: TrafficSpecification,
    pub maddress: MacAddress,
    pub hints: Option<Hints>,
}

impl ListenerConfiguration {
    pub fn new(
        interface: String,
        stream: StreamConfiguration,
        traffic: TrafficSpecification,
        maddress: MacAddress,
        hints: Option<Hints>,
    ) -> TypedResult<Self> {
        if stream.txoffset >= traffic.interval {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!(
                    "Invalid TxOffset {}, it reaches the interval {}",
                    stream.txoffset,
                    traffic.interval
                ),
            ));
        }
        Ok(Self {
            interface,
            stream,
            traffic,
            maddress,
            hints,
        })
    }
}

/// Interface-level initialization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfiguration {
    pub interface: String,
    pub hints: Option<Hints>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(txoffset: u64) -> StreamConfiguration {
        StreamConfiguration::new(
            "7a:b9:ed:d6:d2:12".parse().unwrap(),
            3,
            6,
            txoffset,
            None,
        )
        .unwrap()
    }

    #[test]
    fn mac_address_roundtrip() {
        let addr: MacAddress = "7a:b9:ed:d6:d2:12".parse().unwrap();
        assert_eq!(addr.to_string(), "7a:b9:ed:d6:d2:12");
    }

    #[test]
    fn mac_address_rejects_garbage() {
        assert!("7a:b9:ed:d6:d2".parse::<MacAddress>().is_err());
        assert!("7a:b9:ed:d6:d2:12:34".parse::<MacAddress>().is_err());
        assert!("7a:b9:ed:d6:d2:zz".parse::<MacAddress>().is_err());
        assert!("7ab9edd6d212".parse::<MacAddress>().is_err());
    }

    #[test]
    fn vlan_id_range_enforced() {
        let addr: MacAddress = "7a:b9:ed:d6:d2:12".parse().unwrap();
        assert!(StreamConfiguration::new(addr, 1, 6, 0, None).is_err());
        assert!(StreamConfiguration::new(addr, 4095, 6, 0, None).is_err());
        assert!(StreamConfiguration::new(addr, 2, 6, 0, None).is_ok());
        assert!(StreamConfiguration::new(addr, 4094, 6, 0, None).is_ok());
    }

    #[test]
    fn txoffset_must_stay_inside_interval() {
        let traffic = TrafficSpecification::new(20_000_000, 1522).unwrap();

        let config = Configuration::new("eth0".into(), stream(0), traffic, None);
        assert!(config.is_ok());

        let config = Configuration::new("eth0".into(), stream(19_999_999), traffic, None);
        assert!(config.is_ok());

        let config = Configuration::new("eth0".into(), stream(20_000_000), traffic, None);
        assert_eq!(config.unwrap_err().err(), SystemError::InvalidArgument);
    }

    #[test]
    fn traffic_specification_rejects_zero() {
        assert!(TrafficSpecification::new(0, 1522).is_err());
        assert!(TrafficSpecification::new(20_000_000, 0).is_err());
    }
}
