// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Grouped two-level tree.
//!
//! Peers are split into contiguous index ranges of `floor(sqrt(n))` peers.
//! The originator sends to one random member of each range with hop 1, who
//! then forwards to the rest of its range with hop 0.

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use rand::prelude::*;

use super::{Delivery, Strategy, StrategyContext, StrategyError};
use crate::{PeerId, RequestId, StrategyCode};

pub struct SimpleStrategy {
    ctx: StrategyContext,
}

impl SimpleStrategy {
    #[must_use]
    pub const fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }
}

/// Splits `0..max_peers` into contiguous groups of `max(1, floor(sqrt(max_peers)))`.
fn groups(max_peers: usize) -> impl Iterator<Item = Range<PeerId>> {
    let size = max_peers.isqrt().max(1);
    (0..max_peers)
        .step_by(size)
        .map(move |start| start..(start + size).min(max_peers))
}

#[async_trait]
impl Strategy for SimpleStrategy {
    fn code(&self) -> StrategyCode {
        self.ctx.code
    }

    async fn execute(
        &self,
        request_id: RequestId,
        data: Bytes,
        max_peers: usize,
    ) -> Result<(), StrategyError> {
        let local = self.ctx.local_id;
        let targets: Vec<_> = {
            let mut rng = rand::rng();
            groups(max_peers)
                .filter_map(|group| group.filter(|&id| id != local).choose(&mut rng))
                .collect()
        };
        let peers = self.ctx.resolve(targets)?;
        let packet = self.ctx.origin_packet(request_id, data, max_peers, 1);
        self.ctx.send_concurrently(&peers, &packet).await;
        Ok(())
    }

    async fn handle_packet(&self, delivery: Delivery) -> Result<(), StrategyError> {
        match delivery.hop {
            0 => Ok(()),
            1 => {
                let local = self.ctx.local_id;
                let Some(group) = groups(delivery.max_peers).find(|g| g.contains(&local)) else {
                    return Ok(());
                };
                let targets =
                    group.filter(|&id| id != local && id != delivery.original_sender);
                let peers = self.ctx.resolve_available(targets);
                let packet = delivery.forward(self.ctx.code, 0);
                self.ctx.send_concurrently(&peers, &packet).await;
                Ok(())
            }
            hop => Err(StrategyError::InvalidHop(hop)),
        }
    }
}
