//! Allocation of socket priorities, traffic classes and hardware queues
//!
//! One [`Mapping`] exists per interface. The static relations (traffic class
//! to socket priority, socket priority to PCP, traffic class to hardware
//! queue) are fixed at construction; what changes at runtime is only which
//! triples are handed out to streams. Assignments are drawn from three
//! ordered free-lists so results are deterministic, lowest index first.
use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{SystemError, TypedError, TypedResult};

/// Socket priority 0 is the Linux default, left to best effort traffic.
/// Priorities 1 to 6 can be set without CAP_NET_ADMIN (see socket(7)), so
/// reservations start at 7.
pub const BEST_EFFORT_SOCKET_PRIO: u32 = 0;

/// Traffic class 0 carries best effort, mirroring socket priority 0.
pub const BEST_EFFORT_TC: u8 = 0;

/// A contiguous run of hardware queues assigned to one traffic class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRange {
    pub offset: u8,
    pub num_queues: u8,
}

/// Resource pools and static relations for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    num_tx_queues: u8,
    available_socket_prios: Vec<u32>,
    available_tcs: Vec<u8>,
    available_tx_queues: Vec<u8>,
    tc_to_soprio: Vec<u32>,
    soprio_to_pcp: BTreeMap<u32, u8>,
    tc_to_hwq: Vec<QueueRange>,
}

impl Mapping {
    /// Builds the fixed mapping for a device with `num_tx_queues` Tx queues.
    ///
    /// With 8 queues this yields socket priorities 7..=13, traffic classes
    /// 1..=7 and queues 1..=7 available for streams, while queue 0, traffic
    /// class 0 and socket priority 0 stay pinned to best effort.
    pub fn new(num_tx_queues: u8) -> Self {
        assert!(num_tx_queues >= 2, "a device needs at least two Tx queues");

        let streams = u32::from(num_tx_queues) - 1;

        let available_socket_prios: Vec<u32> = (7..7 + streams).collect();
        let available_tcs: Vec<u8> = (1..num_tx_queues).collect();
        let available_tx_queues: Vec<u8> = (1..num_tx_queues).collect();

        // Index: tc, value: soprio. E.g. with 8 queues [0, 7, 8, .., 13]
        let mut tc_to_soprio = vec![BEST_EFFORT_SOCKET_PRIO];
        tc_to_soprio.extend(7..7 + streams);

        // Monotonic soprio to PCP relation, soprio 0 pinned to PCP 0
        let soprio_to_pcp = tc_to_soprio
            .iter()
            .enumerate()
            .map(|(pcp, soprio)| (*soprio, pcp as u8))
            .collect();

        // One hardware queue per traffic class
        let tc_to_hwq = (0..num_tx_queues)
            .map(|offset| QueueRange {
                offset,
                num_queues: 1,
            })
            .collect();

        Self {
            num_tx_queues,
            available_socket_prios,
            available_tcs,
            available_tx_queues,
            tc_to_soprio,
            soprio_to_pcp,
            tc_to_hwq,
        }
    }

    /// Reserves a (socket priority, traffic class, queue) triple for a new
    /// stream.
    ///
    /// The acquisition is transactional: when a later pool turns out to be
    /// empty, the values already popped are pushed back to the head of their
    /// lists before the error is returned.
    pub fn assign_and_map(&mut self) -> TypedResult<(u32, u8, u8)> {
        debug!("Assigning and mapping resources");

        let soprio = self.assign_soprio()?;

        let tc = match self.assign_tc() {
            Ok(tc) => tc,
            Err(e) => {
                self.free_soprio(soprio);
                return Err(e);
            }
        };

        let queue = match self.assign_queue() {
            Ok(queue) => queue,
            Err(e) => {
                self.free_tc(tc);
                self.free_soprio(soprio);
                return Err(e);
            }
        };

        Ok((soprio, tc, queue))
    }

    /// Returns a previously reserved triple to the pools.
    ///
    /// The values are inserted at the head of their free-lists, so the next
    /// assignment keeps handing out the lowest index first.
    pub fn unmap_and_free(&mut self, soprio: u32, tc: u8, queue: u8) -> TypedResult<()> {
        // All pools full means nothing is allocated and there is nothing to
        // free; accepting the call anyway would corrupt the accounting.
        if self.available_tcs.len() == usize::from(self.num_tx_queues) - 1 {
            return Err(TypedError::new(
                SystemError::InvariantViolation,
                anyhow!("Freeing tc {tc} would leave no traffic class allocated"),
            ));
        }

        self.free_queue(queue);
        self.free_tc(tc);
        self.free_soprio(soprio);

        Ok(())
    }

    fn assign_soprio(&mut self) -> TypedResult<u32> {
        if self.available_socket_prios.is_empty() {
            return Err(TypedError::new(
                SystemError::ResourceExhausted,
                anyhow!("No socket priority left"),
            ));
        }

        Ok(self.available_socket_prios.remove(0))
    }

    fn free_soprio(&mut self, soprio: u32) {
        self.available_socket_prios.insert(0, soprio);
    }

    fn assign_tc(&mut self) -> TypedResult<u8> {
        if self.available_tcs.is_empty() {
            return Err(TypedError::new(
                SystemError::ResourceExhausted,
                anyhow!("No traffic class left"),
            ));
        }

        Ok(self.available_tcs.remove(0))
    }

    fn free_tc(&mut self, tc: u8) {
        self.available_tcs.insert(0, tc);
    }

    fn assign_queue(&mut self) -> TypedResult<u8> {
        if self.available_tx_queues.is_empty() {
            return Err(TypedError::new(
                SystemError::ResourceExhausted,
                anyhow!("All available Tx queues are allocated already"),
            ));
        }

        Ok(self.available_tx_queues.remove(0))
    }

    fn free_queue(&mut self, queue: u8) {
        self.available_tx_queues.insert(0, queue);
    }

    /// The 16 entry socket priority to traffic class relation consumed by
    /// the qdisc. Priorities not assigned to a stream fall back to the best
    /// effort class.
    pub fn soprio_to_tc(&self) -> Vec<u8> {
        let mut mapping = vec![BEST_EFFORT_TC; 16];
        for (tc, soprio) in self.tc_to_soprio.iter().enumerate() {
            mapping[*soprio as usize] = tc as u8;
        }

        mapping
    }

    pub fn soprio_to_pcp(&self) -> &BTreeMap<u32, u8> {
        &self.soprio_to_pcp
    }

    pub fn tc_to_hwq(&self) -> &[QueueRange] {
        &self.tc_to_hwq
    }

    pub fn num_tx_queues(&self) -> u8 {
        self.num_tx_queues
    }

    #[cfg(test)]
    fn available(&self) -> (&[u32], &[u8], &[u8]) {
        (
            &self.available_socket_prios,
            &self.available_tcs,
            &self.available_tx_queues,
        )
    }
}
