//! Simulated device memory for testing.
//!
//! Backs every DRAM channel and every core-local memory with sparse
//! 4 KiB pages, so tests can exercise the full allocator/queue/loader
//! stack against realistic addresses without reserving gigabytes.
//! Unallocated memory reads as zero, matching DRAM after device init.
//!
//! The simulator is purely passive: it never consumes commands. Tests
//! drive "device progress" by writing queue read pointers through the
//! same interface the firmware would use.

use std::collections::BTreeMap;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::device::coords::CoreCoord;
use crate::device::transport::{DeviceId, DramAddr, DramTarget, Transport};
use crate::error::Result;

const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// One simulated address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Space {
    Dram {
        device: DeviceId,
        channel: u8,
    },
    Core {
        device: DeviceId,
        x: u8,
        y: u8,
    },
}

#[derive(Default)]
struct SimState {
    pages: BTreeMap<(Space, u64), Box<[u8; PAGE_SIZE]>>,
    words_written: u64,
    words_read: u64,
    barriers: u64,
    fences: u64,
}

impl SimState {
    fn write_bytes(&mut self, space: Space, addr: u64, data: &[u8]) {
        let mut current = addr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page_addr = current & PAGE_MASK;
            let page = self
                .pages
                .entry((space, page_addr))
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            let offset = (current - page_addr) as usize;
            let take = remaining.len().min(PAGE_SIZE - offset);
            page[offset..offset + take].copy_from_slice(&remaining[..take]);
            current += take as u64;
            remaining = &remaining[take..];
        }
    }

    fn read_bytes(&self, space: Space, addr: u64, buf: &mut [u8]) {
        let mut current = addr;
        let mut filled = 0;
        while filled < buf.len() {
            let page_addr = current & PAGE_MASK;
            let offset = (current - page_addr) as usize;
            let take = (buf.len() - filled).min(PAGE_SIZE - offset);
            match self.pages.get(&(space, page_addr)) {
                Some(page) => buf[filled..filled + take]
                    .copy_from_slice(&page[offset..offset + take]),
                None => buf[filled..filled + take].fill(0),
            }
            current += take as u64;
            filled += take;
        }
    }
}

/// Sparse in-memory [`Transport`] implementation.
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    fn write_words_at(&self, space: Space, addr: u64, words: &[u32]) {
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(words, &mut bytes);
        let mut state = self.state.lock().unwrap();
        state.write_bytes(space, addr, &bytes);
        state.words_written += words.len() as u64;
    }

    fn read_words_at(&self, space: Space, addr: u64, len: usize) -> Vec<u32> {
        let mut bytes = vec![0u8; len * 4];
        let mut state = self.state.lock().unwrap();
        state.read_bytes(space, addr, &mut bytes);
        state.words_read += len as u64;
        let mut words = vec![0u32; len];
        LittleEndian::read_u32_into(&bytes, &mut words);
        words
    }

    /// Total words written through this transport.
    pub fn words_written(&self) -> u64 {
        self.state.lock().unwrap().words_written
    }

    /// Number of memory barriers issued.
    pub fn barriers(&self) -> u64 {
        self.state.lock().unwrap().barriers
    }

    /// Number of store fences issued.
    pub fn fences(&self) -> u64 {
        self.state.lock().unwrap().fences
    }

    /// Number of pages the sparse store has materialized.
    pub fn allocated_pages(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn write_dram(
        &self,
        target: DramTarget,
        addr: DramAddr,
        words: &[u32],
        _ordered_with_previous: bool,
    ) -> Result<()> {
        self.write_words_at(
            Space::Dram {
                device: target.device,
                channel: target.channel,
            },
            addr.0,
            words,
        );
        Ok(())
    }

    fn read_dram(&self, target: DramTarget, addr: DramAddr, len: usize) -> Result<Vec<u32>> {
        Ok(self.read_words_at(
            Space::Dram {
                device: target.device,
                channel: target.channel,
            },
            addr.0,
            len,
        ))
    }

    fn write_core(
        &self,
        device: DeviceId,
        core: CoreCoord,
        addr: DramAddr,
        words: &[u32],
    ) -> Result<()> {
        self.write_words_at(
            Space::Core {
                device,
                x: core.x,
                y: core.y,
            },
            addr.0,
            words,
        );
        Ok(())
    }

    fn read_core(
        &self,
        device: DeviceId,
        core: CoreCoord,
        addr: DramAddr,
        len: usize,
    ) -> Result<Vec<u32>> {
        Ok(self.read_words_at(
            Space::Core {
                device,
                x: core.x,
                y: core.y,
            },
            addr.0,
            len,
        ))
    }

    fn memory_barrier(&self, _device: DeviceId) -> Result<()> {
        self.state.lock().unwrap().barriers += 1;
        Ok(())
    }

    fn fence(&self) {
        self.state.lock().unwrap().fences += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dram_round_trip() {
        let sim = SimTransport::new();
        let target = DramTarget::new(0, 2);
        sim.write_dram(target, DramAddr(0x10_0000), &[1, 2, 3, 4], false)
            .unwrap();
        assert_eq!(
            sim.read_dram(target, DramAddr(0x10_0000), 4).unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn unallocated_reads_zero() {
        let sim = SimTransport::new();
        let target = DramTarget::new(0, 0);
        assert_eq!(
            sim.read_dram(target, DramAddr(0x7FFF_0000), 2).unwrap(),
            vec![0, 0]
        );
    }

    #[test]
    fn channels_are_isolated() {
        let sim = SimTransport::new();
        sim.write_dram(DramTarget::new(0, 0), DramAddr(0x1000), &[7], false)
            .unwrap();
        assert_eq!(
            sim.read_dram(DramTarget::new(0, 1), DramAddr(0x1000), 1).unwrap(),
            vec![0]
        );
        assert_eq!(
            sim.read_dram(DramTarget::new(1, 0), DramAddr(0x1000), 1).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn cross_page_write_allocates_two_pages() {
        let sim = SimTransport::new();
        let target = DramTarget::new(0, 0);
        // Two words straddling the 4 KiB boundary.
        sim.write_dram(target, DramAddr(4092), &[0xAAAA_AAAA, 0xBBBB_BBBB], false)
            .unwrap();
        assert_eq!(sim.allocated_pages(), 2);
        assert_eq!(
            sim.read_dram(target, DramAddr(4092), 2).unwrap(),
            vec![0xAAAA_AAAA, 0xBBBB_BBBB]
        );
    }

    #[test]
    fn core_space_round_trip_and_broadcast() {
        let sim = SimTransport::new();
        let cores = [CoreCoord::new(1, 1), CoreCoord::new(2, 1)];
        sim.broadcast_to_cores(0, &cores, DramAddr(0x40), &[9, 9]).unwrap();
        for core in cores {
            assert_eq!(
                sim.read_core(0, core, DramAddr(0x40), 2).unwrap(),
                vec![9, 9]
            );
        }
        assert_eq!(
            sim.read_core(0, CoreCoord::new(3, 1), DramAddr(0x40), 2).unwrap(),
            vec![0, 0]
        );
    }
}
