//! Allocation state
//!
//! One allocation per client transport address. It owns a relayed address,
//! the set of peers allowed to reach the client through it, and the channel
//! numbers bound to those peers. Permissions and channels expire on their
//! own; the allocation's expiry invalidates all of them at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tunnel_core::p2p::TransactionId;
use tunnel_core::relay::message::{is_valid_channel, AllocationId, RelayErrorCode};

#[derive(Debug, Clone, Copy)]
struct ChannelBinding {
    peer: SocketAddr,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct Allocation {
    pub id: AllocationId,
    /// Only this address may issue requests naming the allocation
    pub client: SocketAddr,
    pub relayed: SocketAddr,
    /// Transaction of the Allocate request that created it
    pub created_by: TransactionId,
    expires_at: Instant,
    permissions: HashMap<SocketAddr, Instant>,
    channels: HashMap<u16, ChannelBinding>,
    channel_by_peer: HashMap<SocketAddr, u16>,
    bytes_relayed: u64,
}

impl Allocation {
    pub fn new(
        id: AllocationId,
        client: SocketAddr,
        relayed: SocketAddr,
        created_by: TransactionId,
        lifetime: Duration,
        now: Instant,
    ) -> Self {
        Allocation {
            id,
            client,
            relayed,
            created_by,
            expires_at: now + lifetime,
            permissions: HashMap::new(),
            channels: HashMap::new(),
            channel_by_peer: HashMap::new(),
            bytes_relayed: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn refresh(&mut self, lifetime: Duration, now: Instant) {
        self.expires_at = now + lifetime;
    }

    /// Whole seconds left, rounded up
    pub fn remaining_secs(&self, now: Instant) -> u32 {
        let left = self.expires_at.saturating_duration_since(now);
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        secs.min(u64::from(u32::MAX)) as u32
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    // ------------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------------

    /// Install or renew a permission for exactly `peer`
    pub fn create_permission(
        &mut self,
        peer: SocketAddr,
        lifetime: Duration,
        max_permissions: usize,
        now: Instant,
    ) -> Result<(), RelayErrorCode> {
        self.prune(now);

        if !self.permissions.contains_key(&peer) && self.permissions.len() >= max_permissions {
            return Err(RelayErrorCode::QuotaExceeded);
        }

        self.permissions.insert(peer, now + lifetime);
        Ok(())
    }

    pub fn has_permission(&self, peer: SocketAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer)
            .is_some_and(|expires_at| now < *expires_at)
    }

    /// Extend a live permission on outbound traffic
    pub fn touch_permission(&mut self, peer: SocketAddr, lifetime: Duration, now: Instant) {
        if let Some(expires_at) = self.permissions.get_mut(&peer) {
            if now < *expires_at {
                *expires_at = (*expires_at).max(now + lifetime);
            }
        }
    }

    pub fn permission_count(&self) -> usize {
        self.permissions.len()
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Bind `channel` to `peer`, renewing an identical binding
    ///
    /// A channel stays tied to one peer (and a peer to one channel) until the
    /// binding expires. Binding also installs a permission for the peer.
    pub fn bind_channel(
        &mut self,
        channel: u16,
        peer: SocketAddr,
        lifetime: Duration,
        permission_lifetime: Duration,
        limits: (usize, usize),
        now: Instant,
    ) -> Result<(), RelayErrorCode> {
        let (max_channels, max_permissions) = limits;
        if !is_valid_channel(channel) {
            return Err(RelayErrorCode::BadRequest);
        }

        self.prune(now);

        match self.channels.get(&channel) {
            Some(binding) if binding.peer != peer => return Err(RelayErrorCode::BadRequest),
            Some(_) => {}
            None => {
                if self.channel_by_peer.contains_key(&peer) {
                    return Err(RelayErrorCode::BadRequest);
                }
                if self.channels.len() >= max_channels {
                    return Err(RelayErrorCode::QuotaExceeded);
                }
            }
        }

        self.create_permission(peer, permission_lifetime, max_permissions, now)?;
        self.channels.insert(
            channel,
            ChannelBinding {
                peer,
                expires_at: now + lifetime,
            },
        );
        self.channel_by_peer.insert(peer, channel);
        Ok(())
    }

    pub fn channel_peer(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.channels
            .get(&channel)
            .filter(|binding| now < binding.expires_at)
            .map(|binding| binding.peer)
    }

    pub fn channel_for(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let channel = *self.channel_by_peer.get(&peer)?;
        self.channel_peer(channel, now).map(|_| channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // ------------------------------------------------------------------------
    // Quota
    // ------------------------------------------------------------------------

    /// Account `bytes` against the quota, false once it would be exceeded
    pub fn charge(&mut self, bytes: usize, quota: u64) -> bool {
        let total = self.bytes_relayed.saturating_add(bytes as u64);
        if quota != 0 && total > quota {
            return false;
        }
        self.bytes_relayed = total;
        true
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }

    /// Drop expired permissions and channel bindings
    pub fn prune(&mut self, now: Instant) {
        self.permissions.retain(|_, expires_at| now < *expires_at);

        let channel_by_peer = &mut self.channel_by_peer;
        self.channels.retain(|channel, binding| {
            let live = now < binding.expires_at;
            if !live {
                channel_by_peer.remove(&binding.peer);
                log::debug!("Channel {:#06x} to {} expired", channel, binding.peer);
            }
            live
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
