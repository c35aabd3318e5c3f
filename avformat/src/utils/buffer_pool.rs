use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::structs::packet::Packet;
use crate::utils::errors::PoolError;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Handle of one outstanding pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pool: u32,
    index: u32,
}

impl SlotId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A packet checked out of a [`PacketPool`].
#[derive(Debug)]
pub struct PooledPacket {
    slot: SlotId,
    pub packet: Packet,
}

impl PooledPacket {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn into_parts(self) -> (SlotId, Packet) {
        (self.slot, self.packet)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<Packet>,
    outstanding: HashSet<u32>,
    next_index: u32,
}

/// A thread-safe packet pool.
///
/// Recycles packet allocations under sustained throughput. Every checked out
/// slot has exactly one owner; releasing a slot that is not outstanding is
/// reported as an error.
#[derive(Debug, Clone)]
pub struct PacketPool {
    id: u32,
    state: Arc<Mutex<PoolState>>,
    max_size: usize,
    buffer_capacity: usize,
}

impl PacketPool {
    /// Creates a new pool.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of released packets kept for reuse
    /// * `buffer_capacity` - Initial payload capacity of freshly allocated packets
    pub fn new(max_size: usize, buffer_capacity: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(PoolState {
                free: VecDeque::with_capacity(max_size),
                ..PoolState::default()
            })),
            max_size,
            buffer_capacity,
        }
    }

    fn register(&self, state: &mut PoolState) -> SlotId {
        let index = state.next_index;
        state.next_index = state.next_index.wrapping_add(1);
        state.outstanding.insert(index);
        SlotId {
            pool: self.id,
            index,
        }
    }

    /// Takes a packet from the pool, allocating when none is free.
    pub fn alloc(&self) -> PooledPacket {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let packet = state
            .free
            .pop_front()
            .unwrap_or_else(|| Packet::from_vec(Vec::with_capacity(self.buffer_capacity)));
        let slot = self.register(&mut state);
        PooledPacket { slot, packet }
    }

    /// Puts `packet`, produced elsewhere, under a new slot of this pool.
    pub fn adopt(&self, packet: Packet) -> PooledPacket {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = self.register(&mut state);
        PooledPacket { slot, packet }
    }

    /// An empty payload buffer, recycled from a released packet when one is
    /// available.
    pub fn take_buffer(&self) -> Vec<u8> {
        let recycled = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .pop_front();
        match recycled {
            Some(mut packet) => {
                let mut buffer = packet.take_data();
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(self.buffer_capacity),
        }
    }

    /// Returns a checked out packet.
    pub fn free(&self, pooled: PooledPacket) -> Result<(), PoolError> {
        let (slot, packet) = pooled.into_parts();
        self.release(slot, packet)
    }

    /// Returns `packet` under `slot`.
    pub fn release(&self, slot: SlotId, mut packet: Packet) -> Result<(), PoolError> {
        if slot.pool != self.id {
            return Err(PoolError::ForeignSlot(slot.index));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.outstanding.remove(&slot.index) {
            return Err(PoolError::DoubleFree(slot.index));
        }

        packet.reset();
        if state.free.len() < self.max_size && packet.capacity() > 0 {
            state.free.push_back(packet);
        }
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).outstanding.len()
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).free.len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(64, 64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_release_is_rejected() {
        let pool = PacketPool::new(4, 16);
        let pooled = pool.alloc();
        let slot = pooled.slot();
        let (_, packet) = pooled.into_parts();

        assert_eq!(pool.outstanding(), 1);
        assert!(pool.release(slot, packet.clone()).is_ok());
        assert_eq!(
            pool.release(slot, packet),
            Err(PoolError::DoubleFree(slot.index()))
        );
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn foreign_slot_is_rejected() {
        let a = PacketPool::default();
        let b = PacketPool::default();
        let pooled = a.alloc();
        let slot = pooled.slot();
        assert_eq!(
            b.free(pooled),
            Err(PoolError::ForeignSlot(slot.index()))
        );
    }

    #[test]
    fn adopted_packets_recycle_their_buffers() -> anyhow::Result<()> {
        let pool = PacketPool::new(2, 0);
        let pooled = pool.adopt(Packet::from_vec(vec![7; 4096]));
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pooled.packet.size(), 4096);
        assert_eq!(pool.available(), 0);

        pool.free(pooled)?;
        assert_eq!(pool.outstanding(), 0);
        let buffer = pool.take_buffer();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= 4096);
        assert_eq!(pool.available(), 0);
        Ok(())
    }

    #[test]
    fn released_packets_are_reset_and_reused() {
        let pool = PacketPool::new(1, 8);
        let mut first = pool.alloc();
        first.packet.data_mut().extend_from_slice(&[1, 2, 3]);
        first.packet.pts = 42;
        pool.free(first).unwrap();
        assert_eq!(pool.available(), 1);

        let second = pool.alloc();
        assert!(second.packet.is_empty());
        assert_eq!(second.packet.pts, crate::structs::rational::NOPTS_VALUE);
        assert_eq!(pool.available(), 0);
        assert_ne!(second.slot().index(), 0);
    }
}
