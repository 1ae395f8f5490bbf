//! iproute2 tc command invocations for the taprio qdisc
use std::process::Command;

use anyhow::anyhow;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};
use detd_core::mapping::Mapping;
use detd_core::scheduler::Schedule;

pub struct CommandTc;

impl CommandTc {
    fn run(args: Vec<String>) -> TypedResult<()> {
        debug!("Running: tc {}", args.join(" "));

        let output = Command::new("tc")
            .args(&args)
            .output()
            .typ(SystemError::SystemConfigFailed)?;

        if !output.status.success() {
            return Err(TypedError::new(
                SystemError::SystemConfigFailed,
                anyhow!(
                    "tc {} failed: {} {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    /// Installs the time aware scheduler. With `offload` the schedule is
    /// executed by the controller (flags 0x2), otherwise in software against
    /// CLOCK_TAI.
    pub fn set_taprio(
        interface: &str,
        mapping: &Mapping,
        schedule: &Schedule,
        base_time: u64,
        offload: bool,
    ) -> TypedResult<()> {
        Self::run(set_taprio_args(
            interface, mapping, schedule, base_time, offload,
        ))
    }

    pub fn unset_taprio(interface: &str) -> TypedResult<()> {
        Self::run(unset_taprio_args(interface))
    }
}

fn set_taprio_args(
    interface: &str,
    mapping: &Mapping,
    schedule: &Schedule,
    base_time: u64,
    offload: bool,
) -> Vec<String> {
    let soprio_to_tc = mapping.soprio_to_tc();

    let mut num_tc: Vec<u8> = soprio_to_tc.clone();
    num_tc.sort_unstable();
    num_tc.dedup();
    let num_tc = num_tc.len();

    let mut args: Vec<String> = [
        "qdisc", "replace", "dev", interface, "parent", "root", "taprio",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("num_tc".into());
    args.push(num_tc.to_string());

    args.push("map".into());
    for tc in &soprio_to_tc {
        args.push(tc.to_string());
    }

    args.push("queues".into());
    for range in mapping.tc_to_hwq() {
        args.push(format!("{}@{}", range.num_queues, range.offset));
    }

    args.push("base-time".into());
    args.push(base_time.to_string());

    for slot in schedule.slots() {
        args.push("sched-entry".into());
        args.push("S".into());
        args.push(gatemask(slot.traffic.tc()));
        args.push(slot.length.to_string());
    }

    args.push("flags".into());
    if offload {
        args.push("0x2".into());
    } else {
        args.push("0x0".into());
        args.push("clockid".into());
        args.push("CLOCK_TAI".into());
    }

    args
}

fn unset_taprio_args(interface: &str) -> Vec<String> {
    ["qdisc", "del", "dev", interface, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Gate mask opening exactly the queue of one traffic class, as two hex
/// digits
fn gatemask(tc: u8) -> String {
    format!("{:02X}", 1u8 << tc)
}

#[cfg(test)]
mod tests {
    use detd_core::scheduler::{ScheduledTraffic, Scheduler};
    use detd_core::stream::{Configuration, StreamConfiguration, TrafficSpecification};

    use super::*;

    fn schedule_with_one_stream() -> Scheduler {
        let stream = StreamConfiguration::new(
            "7a:b9:ed:d6:d2:12".parse().unwrap(),
            3,
            6,
            0,
            None,
        )
        .unwrap();
        let spec = TrafficSpecification::new(20_000_000, 1522).unwrap();
        let config = Configuration::new("eth0".into(), stream, spec, None).unwrap();

        let mut scheduler = Scheduler::new();
        scheduler
            .add(ScheduledTraffic::new(&config, 1_000_000_000, 1).unwrap())
            .unwrap();
        scheduler
    }

    #[test]
    fn gatemask_sets_single_bit() {
        assert_eq!(gatemask(0), "01");
        assert_eq!(gatemask(1), "02");
        assert_eq!(gatemask(7), "80");
    }

    #[test]
    fn taprio_offload_command_line() {
        let mapping = Mapping::new(8);
        let scheduler = schedule_with_one_stream();

        let args = set_taprio_args("eth0", &mapping, scheduler.schedule(), 1_000, true);

        assert_eq!(
            args.join(" "),
            "qdisc replace dev eth0 parent root taprio \
             num_tc 8 \
             map 0 0 0 0 0 0 0 1 2 3 4 5 6 7 0 0 \
             queues 1@0 1@1 1@2 1@3 1@4 1@5 1@6 1@7 \
             base-time 1000 \
             sched-entry S 02 12176 \
             sched-entry S 01 19987824 \
             flags 0x2"
        );
    }

    #[test]
    fn taprio_software_fallback_uses_tai_clock() {
        let mapping = Mapping::new(8);
        let scheduler = schedule_with_one_stream();

        let args = set_taprio_args("eth0", &mapping, scheduler.schedule(), 1_000, false);
        let tail = args[args.len() - 3..].join(" ");

        assert_eq!(tail, "flags 0x0 clockid CLOCK_TAI");
    }

    #[test]
    fn taprio_delete_command_line() {
        assert_eq!(
            unset_taprio_args("eth0").join(" "),
            "qdisc del dev eth0 root"
        );
    }
}
