//! Device command wire format.
//!
//! Each command queue slot holds one fixed-size command. The first two
//! words are common to every opcode:
//!
//! ```text
//! word 0:  [31:0]  low 32 bits of the target DRAM address
//! word 1:  [31:28] opcode
//!          [27:22] target core Y (6 bits)
//!          [21:16] target core X (6 bits)
//!          [15:0]  high 16 bits of the target DRAM address
//! ```
//!
//! Subsequent words are opcode-specific and zero-padded out to the slot
//! size. The layouts here must match the device firmware bit-for-bit;
//! nothing validates them at the other end.

use smallvec::SmallVec;

use crate::device::coords::{CoreCoord, GridShape};
use crate::device::transport::DramAddr;
use crate::error::{LoaderError, Result};

/// Fixed command-queue grid, one cell per routing core.
pub const GRID: GridShape = GridShape::new(12, 10);

/// Bytes per command queue slot.
pub const COMMAND_SLOT_BYTES: u32 = 64;
/// 32-bit words per command queue slot.
pub const COMMAND_SLOT_WORDS: usize = (COMMAND_SLOT_BYTES / 4) as usize;
/// Bytes reserved at the head of each queue for pointers and metadata.
pub const QUEUE_HEADER_BYTES: u32 = 32;
/// Byte offset of the read pointer within the queue header.
pub const RD_PTR_OFFSET: u64 = 0;
/// Byte offset of the write pointer within the queue header.
pub const WR_PTR_OFFSET: u64 = 4;
/// Byte offset of the firmware-init mailbox within the queue header.
pub const FW_MAILBOX_OFFSET: u64 = 8;
/// Value the device firmware writes to the mailbox once the queue is
/// serviced.
pub const FW_READY_MAGIC: u32 = 0xF;

/// Default number of command slots per queue. Must stay a power of two.
pub const DEFAULT_COMMAND_SLOTS: u32 = 256;
/// Default number of binary cache slots per DRAM channel.
pub const DEFAULT_BINARY_SLOTS: u32 = 32;
/// Default number of buffer addresses one pointer-update blob can hold.
pub const DEFAULT_UPDATE_BLOB_ENTRIES: u32 = 120;
/// Number of broadcast-sync flag slots reserved below the queue table.
pub const SYNC_SLOTS: u32 = 256;
/// Bytes per sync flag slot.
pub const SYNC_SLOT_BYTES: u32 = 64;

/// Bytes of one pointer-update blob: two words per buffer address,
/// rounded up to a 64-byte transfer boundary.
pub fn update_blob_bytes(entries: u32) -> u64 {
    let raw = entries as u64 * 8;
    (raw + 63) & !63
}

/// A command payload. At most one slot's worth of words; shorter payloads
/// are zero-padded when written to DRAM.
pub type CommandWords = SmallVec<[u32; COMMAND_SLOT_WORDS]>;

/// Command opcodes understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Run the epoch whose binary block is at the target address.
    Valid = 0x1,
    /// No work this round; do not replay a stale epoch.
    NotValid = 0x2,
    /// Update an io-queue header (or a blob of headers).
    QueueUpdate = 0x3,
    /// Apply an arithmetic update to header fields (pointer variables).
    PointerUpdate = 0x4,
    /// Begin a device-side loop over the following commands.
    LoopStart = 0x5,
    /// End of the device-side loop body.
    LoopEnd = 0x6,
    /// Terminate the program on this core.
    EndProgram = 0xF,
}

/// Extract the opcode field from an encoded command.
pub fn opcode_bits(words: &[u32]) -> u32 {
    words.get(1).map_or(0, |w| w >> 28)
}

#[inline]
fn address_words(op: Opcode, core: CoreCoord, addr: DramAddr) -> (u32, u32) {
    let lo = (addr.0 & 0xffff_ffff) as u32;
    let hi = ((addr.0 >> 32) & 0xffff) as u32;
    let w1 = ((op as u32) << 28)
        | ((core.y as u32 & 0x3f) << 22)
        | ((core.x as u32 & 0x3f) << 16)
        | hi;
    (lo, w1)
}

/// Build a valid-epoch command pointing at a core's binary block.
///
/// `dram_core` is the routing coordinate of the DRAM channel holding the
/// block. Word 2 carries the performance-trace enable byte and the 16-bit
/// per-core traffic-decouple mask.
pub fn valid_command(
    dram_core: CoreCoord,
    binary_addr: DramAddr,
    perf_trace: bool,
    decouple_mask: u16,
) -> CommandWords {
    let (w0, w1) = address_words(Opcode::Valid, dram_core, binary_addr);
    let w2 = (if perf_trace { 0xff } else { 0 }) | ((decouple_mask as u32) << 8);
    SmallVec::from_slice(&[w0, w1, w2])
}

/// Build a not-valid command.
pub fn invalid_command() -> CommandWords {
    SmallVec::from_slice(&[0, (Opcode::NotValid as u32) << 28])
}

/// Build an end-program command.
pub fn end_program_command() -> CommandWords {
    SmallVec::from_slice(&[0, (Opcode::EndProgram as u32) << 28])
}

/// Build a loop-start command. The loop count occupies the low 28 bits of
/// word 1; larger counts are rejected.
pub fn loop_start_command(loops: u32) -> Result<CommandWords> {
    if loops > 0x0fff_ffff {
        return Err(LoaderError::Misuse(format!(
            "device loop count {} exceeds 28-bit field",
            loops
        )));
    }
    Ok(SmallVec::from_slice(&[
        0,
        ((Opcode::LoopStart as u32) << 28) | loops,
    ]))
}

/// Build a loop-end command.
pub fn loop_end_command() -> CommandWords {
    SmallVec::from_slice(&[0, (Opcode::LoopEnd as u32) << 28])
}

/// Build a queue-update command.
///
/// For a single buffer the address points at the queue header itself; for
/// a batch it points at a DRAM blob listing the header addresses. Words
/// 3..8 carry the first five words of the header image to apply.
pub fn queue_update_command(
    dram_core: CoreCoord,
    addr: DramAddr,
    num_buffers: u8,
    reader_index: u8,
    num_readers: u8,
    update_mask: u8,
    header: &QueueHeader,
) -> CommandWords {
    let (w0, w1) = address_words(Opcode::QueueUpdate, dram_core, addr);
    let w2 = num_buffers as u32
        | ((reader_index as u32) << 8)
        | ((num_readers as u32) << 16)
        | ((update_mask as u32) << 24);
    let mut words = SmallVec::from_slice(&[w0, w1, w2]);
    words.extend_from_slice(&header.words[..5]);
    words
}

// ---------------------------------------------------------------------------
// Pointer-variable update command
// ---------------------------------------------------------------------------

/// Arithmetic opcodes for pointer-variable updates, applied by the device
/// to 16-bit header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PointerVarOpcode {
    IncWrap = 0x1,
    Inc = 0x2,
    Set = 0x3,
    Add = 0x4,
    Mul = 0x5,
}

impl PointerVarOpcode {
    /// Apply this operation to a 16-bit destination the way the firmware
    /// will, `iterations` times for the iteration-dependent ops.
    pub fn apply(&self, dest: &mut u16, operand_0: u32, operand_1: u32, iterations: u32) {
        match self {
            PointerVarOpcode::IncWrap => {
                for _ in 0..iterations {
                    *dest = ((*dest as u32 + operand_0) % operand_1.max(1)) as u16;
                }
            }
            PointerVarOpcode::Inc => {
                for _ in 0..iterations {
                    *dest = (*dest as u32).wrapping_add(operand_0) as u16;
                }
            }
            PointerVarOpcode::Set => *dest = operand_0 as u16,
            PointerVarOpcode::Add => *dest = operand_0.wrapping_add(operand_1) as u16,
            PointerVarOpcode::Mul => *dest = operand_0.wrapping_mul(operand_1) as u16,
        }
    }
}

/// Width of the fields a pointer update touches. Only 16-bit fields are
/// supported, matching the header field positions.
pub const POINTER_UPDATE_FIELD_BYTES: u16 = 2;

/// The full 8-word pointer-update payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerUpdateCommand {
    /// Queue header address, or blob address when `num_buffers > 1`.
    pub addr: DramAddr,
    /// DRAM routing core holding the header or blob.
    pub dram_core: CoreCoord,
    /// Number of buffers updated by this command.
    pub num_buffers: u16,
    /// This consumer's index among the readers syncing on the update.
    pub reader_index: u8,
    /// Total number of syncing readers.
    pub num_readers: u8,
    /// 16-bit mask of adjacent header fields the operation applies to.
    pub update_mask: u16,
    pub opcode: PointerVarOpcode,
    pub operand_0: u32,
    pub operand_1: u32,
}

impl PointerUpdateCommand {
    /// Encode to the 8-word wire layout.
    pub fn encode(&self) -> CommandWords {
        let (w0, w1) = address_words(Opcode::PointerUpdate, self.dram_core, self.addr);
        let w2 = (self.num_buffers as u32 & 0xff)
            | ((self.reader_index as u32) << 8)
            | ((self.num_readers as u32) << 16);
        let w3 = self.update_mask as u32
            | (((self.opcode as u32) & 0x7) << 16)
            | (((POINTER_UPDATE_FIELD_BYTES as u32) & 0x7) << 19);
        SmallVec::from_slice(&[w0, w1, w2, w3, self.operand_0, self.operand_1, 0, 0])
    }
}

// ---------------------------------------------------------------------------
// Io-queue header
// ---------------------------------------------------------------------------

/// Header fields addressable by pointer updates, identified by their
/// 16-bit container position within the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderField {
    GlobalRdptr,
    GlobalWrptr,
    LocalRdptr,
    ZeroSetting,
}

impl HeaderField {
    /// Index of the field's 16-bit container within the header.
    pub fn position(&self) -> u8 {
        match self {
            HeaderField::GlobalRdptr => 0,
            HeaderField::GlobalWrptr => 2,
            HeaderField::LocalRdptr => 4,
            HeaderField::ZeroSetting => 7,
        }
    }
}

/// A set of [`HeaderField`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFieldMask(u8);

impl HeaderFieldMask {
    pub fn single(field: HeaderField) -> Self {
        let mut mask = Self::default();
        mask.set(field);
        mask
    }

    pub fn set(&mut self, field: HeaderField) {
        self.0 |= 1 << field.position();
    }

    pub fn has(&self, field: HeaderField) -> bool {
        self.0 & (1 << field.position()) != 0
    }

    /// The 16-bit wire mask for a pointer-update command. Read-pointer and
    /// write-pointer updates cannot be combined in one command.
    pub fn wire_mask(&self) -> Result<u16> {
        let rd = self.has(HeaderField::GlobalRdptr) || self.has(HeaderField::LocalRdptr);
        if rd && self.has(HeaderField::GlobalWrptr) {
            return Err(LoaderError::Misuse(
                "cannot combine read-pointer and write-pointer updates in one command".into(),
            ));
        }
        Ok(self.0 as u16)
    }
}

/// The 32-byte io-queue header, as an array of eight words. Pointer
/// fields are 16-bit values packed two per word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueHeader {
    pub words: [u32; 8],
}

impl QueueHeader {
    fn get_u16(&self, position: u8) -> u16 {
        let word = self.words[(position / 2) as usize];
        if position % 2 == 0 {
            (word & 0xffff) as u16
        } else {
            (word >> 16) as u16
        }
    }

    fn set_u16(&mut self, position: u8, value: u16) {
        let word = &mut self.words[(position / 2) as usize];
        if position % 2 == 0 {
            *word = (*word & 0xffff_0000) | value as u32;
        } else {
            *word = (*word & 0x0000_ffff) | ((value as u32) << 16);
        }
    }

    pub fn field(&self, field: HeaderField) -> u16 {
        self.get_u16(field.position())
    }

    pub fn set_field(&mut self, field: HeaderField, value: u16) {
        self.set_u16(field.position(), value);
    }

    /// Merge `other` into `self` under an update mask.
    pub fn merge_masked(&mut self, other: &QueueHeader, mask: HeaderUpdateMask) {
        if mask.has_full() {
            self.words = other.words;
            return;
        }
        if mask.has(HeaderUpdateMask::GLOBAL_RD) {
            self.words[0] = other.words[0];
        }
        if mask.has(HeaderUpdateMask::GLOBAL_WR) {
            self.words[1] = other.words[1];
        }
        if mask.has(HeaderUpdateMask::LOCAL_SETTINGS) {
            self.words[2] = other.words[2];
            self.words[3] = other.words[3];
            self.words[4] = other.words[4];
        } else if mask.has(HeaderUpdateMask::LOCAL_RD) {
            self.words[2] = other.words[2];
        }
    }

    /// Whether `self` and `other` agree on every field selected by `mask`.
    pub fn matches_masked(&self, other: &QueueHeader, mask: HeaderUpdateMask) -> bool {
        let mut a = *self;
        a.merge_masked(other, mask);
        a == *self
    }
}

/// 8-bit mask selecting which header regions a queue-update command (or a
/// host-direct header write) applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderUpdateMask(pub u8);

impl HeaderUpdateMask {
    pub const NULL: HeaderUpdateMask = HeaderUpdateMask(0);
    pub const GLOBAL_RD: u8 = 1 << 0;
    pub const GLOBAL_WR: u8 = 1 << 1;
    pub const LOCAL_RD: u8 = 1 << 2;
    pub const LOCAL_SETTINGS: u8 = 1 << 3;
    pub const FULL: HeaderUpdateMask = HeaderUpdateMask(0xff);

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn has_full(&self) -> bool {
        self.0 == 0xff
    }

    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }

    pub fn without(mut self, bit: u8) -> Self {
        self.0 &= !bit;
        self
    }
}
