// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Flat broadcast, the baseline for all other strategies.

use async_trait::async_trait;
use bytes::Bytes;

use super::{Delivery, Strategy, StrategyContext, StrategyError};
use crate::{RequestId, StrategyCode};

/// The originator sends directly to every other peer, nobody forwards.
pub struct Broadcast {
    ctx: StrategyContext,
    /// Send to one peer after another instead of all at once.
    blocking: bool,
}

impl Broadcast {
    #[must_use]
    pub const fn new(ctx: StrategyContext, blocking: bool) -> Self {
        Self { ctx, blocking }
    }
}

#[async_trait]
impl Strategy for Broadcast {
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
        let peers = self.ctx.resolve((0..max_peers).filter(|&id| id != local))?;
        let packet = self.ctx.origin_packet(request_id, data, max_peers, 0);
        if self.blocking {
            self.ctx.send_sequentially(&peers, &packet).await;
        } else {
            self.ctx.send_concurrently(&peers, &packet).await;
        }
        Ok(())
    }

    async fn handle_packet(&self, _delivery: Delivery) -> Result<(), StrategyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recording_peers, test_context};

    #[tokio::test]
    async fn sends_to_all_but_self() {
        let (peers, conns) = recording_peers(4, 3);
        let broadcast = Broadcast::new(test_context(3, peers), false);
        broadcast
            .execute(1, Bytes::from_static(b"data"), 3)
            .await
            .unwrap();

        for (id, conn) in conns.iter().enumerate() {
            let sent = conn.disseminate_packets();
            if id < 3 {
                assert_eq!(sent.len(), 1);
                assert_eq!(sent[0].hop, 0);
                assert_eq!(sent[0].original_sender, 3);
                assert_eq!(sent[0].max_peers, 3);
            } else {
                assert!(sent.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn blocking_skips_self() {
        let (peers, conns) = recording_peers(4, 1);
        let broadcast = Broadcast::new(test_context(1, peers), true);
        broadcast
            .execute(1, Bytes::from_static(b"data"), 4)
            .await
            .unwrap();
        let counts: Vec<_> = conns.iter().map(|c| c.disseminate_packets().len()).collect();
        assert_eq!(counts, vec![1, 0, 1, 1]);
    }

    #[tokio::test]
    async fn invalid_target_sends_nothing() {
        let (peers, conns) = recording_peers(4, 0);
        let broadcast = Broadcast::new(test_context(0, peers), false);
        let res = broadcast.execute(1, Bytes::from_static(b"data"), 5).await;
        assert!(res.is_err());
        assert!(conns.iter().all(|c| c.disseminate_packets().is_empty()));
    }
}
