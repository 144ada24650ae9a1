//! Virtual interface seam
//!
//! The OS-specific TUN device lives outside this crate. The driver only
//! needs to read outbound IP packets and write inbound ones, one packet
//! per call with boundaries preserved.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait VirtualInterface {
    /// Next outbound packet into `buf`, `Ok(None)` when none is pending
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Hand one decrypted packet to the OS
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Default)]
struct Queues {
    outbound: VecDeque<Vec<u8>>,
    delivered: VecDeque<Vec<u8>>,
}

/// In-process interface backed by two queues
///
/// Clones share the same queues, so one handle can be given to the driver
/// while another injects and collects packets.
#[derive(Debug, Clone, Default)]
pub struct MemoryInterface {
    inner: Arc<Mutex<Queues>>,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet as if an application had sent it
    pub fn inject(&self, packet: Vec<u8>) {
        self.lock().outbound.push_back(packet);
    }

    /// Take every packet written by the driver so far
    pub fn take_delivered(&self) -> Vec<Vec<u8>> {
        self.lock().delivered.drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        // Queues stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl VirtualInterface for MemoryInterface {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(packet) = self.lock().outbound.pop_front() else {
            return Ok(None);
        };
        if packet.len() > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "packet larger than buffer"));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(Some(packet.len()))
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.lock().delivered.push_back(packet.to_vec());
        Ok(())
    }
}
