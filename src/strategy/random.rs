// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Two-level random fanout.
//!
//! The originator sends to a random `pct` percent of the peers with hop 1.
//! Each of those forwards to another random `pct` percent with hop 0.
//! Hop 0 recipients forward again only if hop 0 forwarding is enabled.

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use rand::prelude::*;

use super::{Delivery, Strategy, StrategyContext, StrategyError};
use crate::{PeerId, RequestId, StrategyCode};

pub struct RandomStrategy {
    ctx: StrategyContext,
    percentage: usize,
    forward_hop0: bool,
}

impl RandomStrategy {
    #[must_use]
    pub const fn new(ctx: StrategyContext, percentage: usize, forward_hop0: bool) -> Self {
        Self {
            ctx,
            percentage,
            forward_hop0,
        }
    }

    /// Picks distinct random peers in `0..max_peers`, never the local node.
    ///
    /// `max_peers` is capped at the number of peers.
    fn pick_targets(&self, max_peers: usize) -> Vec<PeerId> {
        let local = self.ctx.local_id;
        let max_peers = max_peers.min(self.ctx.peers.len());
        let available = max_peers - usize::from(local < max_peers);
        let count = max_peers
            .checked_mul(self.percentage)
            .map_or(available, |n| n / 100)
            .min(available);
        let mut rng = rand::rng();
        let mut picked = HashSet::with_capacity(count);
        let mut targets = Vec::with_capacity(count);
        while targets.len() < count {
            let id = rng.random_range(0..max_peers);
            if id != local && picked.insert(id) {
                targets.push(id);
            }
        }
        targets
    }

    async fn forward(&self, delivery: &Delivery) {
        let targets = self.pick_targets(delivery.max_peers);
        let peers = self.ctx.resolve_available(targets);
        let packet = delivery.forward(self.ctx.code, 0);
        self.ctx.send_concurrently(&peers, &packet).await;
    }
}

#[async_trait]
impl Strategy for RandomStrategy {
    fn code(&self) -> StrategyCode {
        self.ctx.code
    }

    async fn execute(
        &self,
        request_id: RequestId,
        data: Bytes,
        max_peers: usize,
    ) -> Result<(), StrategyError> {
        let peers = self.ctx.resolve(self.pick_targets(max_peers))?;
        let packet = self.ctx.origin_packet(request_id, data, max_peers, 1);
        self.ctx.send_concurrently(&peers, &packet).await;
        Ok(())
    }

    async fn handle_packet(&self, delivery: Delivery) -> Result<(), StrategyError> {
        match delivery.hop {
            1 => self.forward(&delivery).await,
            0 if self.forward_hop0 => self.forward(&delivery).await,
            0 => trace!("dissemination {:#x} ends here", delivery.request_id),
            hop => return Err(StrategyError::InvalidHop(hop)),
        }
        Ok(())
    }
}
