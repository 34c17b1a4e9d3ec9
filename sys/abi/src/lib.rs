// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the kernel, task code, and module tooling.
//!
//! Everything here is either plain data or a `repr(C)` structure with a
//! layout that external tools (the module packer) and foreign code (loaded
//! modules) rely on. Keep it dependency-light and semver-boring.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod sdk;

/// Task lifecycle state. The scheduler treats this field as the single
/// source of truth for what to do with a task on its next visit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TaskState {
    #[default]
    None = 0,
    Ready = 1,
    Running = 2,
    Done = 3,
    Wait = 4,
}

/// Periodic/wakeup timing attached to every task descriptor. `next_run`
/// is the absolute tick at which a waiting task becomes runnable again.
#[derive(Copy, Clone, Debug, Default)]
pub struct TimingInfo {
    pub period_ms: u32,
    pub next_run: u32,
}

bitflags::bitflags! {
    /// Per-task flag word. The context-switch assembly reads and writes
    /// this directly, so the bit assignments are ABI.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct TaskFlags: u32 {
        /// Task touches the FPU; PendSV must save the upper lane.
        const FPU_USED = 1 << 0;
        /// The upper FPU lane is currently parked on this task's stack.
        const FPU_SAVED = 1 << 1;
    }
}

/// Entry point signature for tasks. `extern "C"` because entries may come
/// from loaded modules as raw addresses.
pub type TaskEntry = extern "C" fn(*mut ());

/// Quantum value meaning "never preempt this task from SysTick". A task
/// carrying it runs until it sleeps, yields, or terminates.
pub const QUANTA_INFINITE: u32 = 0xFFFF_FFFF;

/// Out-of-band condition a scheduler reports alongside (or instead of) a
/// picked task. `EVENT_OK` is the quiet case; anything else is delivered
/// to the registered event handler.
pub type EventCode = u32;

pub const EVENT_OK: EventCode = 0;

/// What an event handler tells the context switch to do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Accept the task the scheduler returned.
    Continue,
    /// Ask the scheduler again; the handler has changed something.
    Retry,
}

pub type EventHandler = fn(EventCode) -> Decision;

/// Syscall numbers, passed in `r0` with arguments in `r1..r3`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Yield = 1,
    Sleep = 2,
    AddTask = 3,
}

impl Syscall {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Yield),
            2 => Some(Self::Sleep),
            3 => Some(Self::AddTask),
            _ => None,
        }
    }
}

/// Number of value slots in a [`TaskConfig`].
pub const CONFIG_SLOTS: usize = 16;

/// A key into the per-task configuration blob.
///
/// Each scheduler policy defines its keys from one-hot flag constants; the
/// bit position selects the storage slot. `group` namespaces the policies
/// so that, in debug builds, handing a round-robin config to the lottery
/// scheduler trips an assertion instead of silently reading a stranger's
/// slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigKey {
    group: u16,
    bit: u16,
}

impl ConfigKey {
    /// Builds a key from a one-hot `flag`. Panics (at compile time for
    /// const keys) when more than one bit is set.
    pub const fn new(group: u16, flag: u32) -> Self {
        assert!(flag.count_ones() == 1, "config flag must be one-hot");
        Self {
            group,
            bit: flag.trailing_zeros() as u16,
        }
    }

    const fn slot(&self) -> usize {
        self.bit as usize
    }

    #[cfg(debug_assertions)]
    const fn tag(&self) -> u32 {
        (self.group as u32) << 16 | self.bit as u32
    }
}

/// Sparse keyed configuration container handed to `add_task`.
///
/// A presence bitset indexed by the key's bit position, paired with a
/// fixed array of words. Debug builds additionally tag each slot with the
/// full key so cross-policy mixups are caught; release builds carry values
/// only. Read-only once `add_task` returns.
#[derive(Copy, Clone, Debug)]
pub struct TaskConfig {
    present: u16,
    #[cfg(debug_assertions)]
    tags: [u32; CONFIG_SLOTS],
    values: [usize; CONFIG_SLOTS],
}

impl TaskConfig {
    pub const fn new() -> Self {
        Self {
            present: 0,
            #[cfg(debug_assertions)]
            tags: [0; CONFIG_SLOTS],
            values: [0; CONFIG_SLOTS],
        }
    }

    /// Stores `value` under `key`, builder-style:
    /// `TaskConfig::new().set(PRIORITY, 1).set(AGING_THRESHOLD, 4)`.
    pub fn set(mut self, key: ConfigKey, value: usize) -> Self {
        let slot = key.slot();
        assert!(slot < CONFIG_SLOTS, "config key out of range");
        self.present |= 1 << slot;
        #[cfg(debug_assertions)]
        {
            self.tags[slot] = key.tag();
        }
        self.values[slot] = value;
        self
    }

    pub fn get(&self, key: ConfigKey) -> Option<usize> {
        let slot = key.slot();
        if slot >= CONFIG_SLOTS || self.present & (1 << slot) == 0 {
            return None;
        }
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.tags[slot],
            key.tag(),
            "config value written under a different policy's key"
        );
        Some(self.values[slot])
    }

    /// Overwrites `dst` when `key` is present; otherwise leaves it alone.
    /// This is how policies apply optional configuration over their
    /// defaults.
    pub fn update<T: ConfigValue>(&self, key: ConfigKey, dst: &mut T) {
        if let Some(word) = self.get(key) {
            *dst = T::from_word(word);
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Conversion from a stored config word into the field types policies use.
pub trait ConfigValue {
    fn from_word(word: usize) -> Self;
}

impl ConfigValue for u8 {
    fn from_word(word: usize) -> Self {
        word as u8
    }
}

impl ConfigValue for u16 {
    fn from_word(word: usize) -> Self {
        word as u16
    }
}

impl ConfigValue for u32 {
    fn from_word(word: usize) -> Self {
        word as u32
    }
}

impl ConfigValue for usize {
    fn from_word(word: usize) -> Self {
        word
    }
}

impl ConfigValue for bool {
    fn from_word(word: usize) -> Self {
        word != 0
    }
}

// --- Module image format ---------------------------------------------------
//
// Loadable modules are packed by external tooling into a flat image: a
// 64-byte header, then the sections the header's descriptors point at.
// These structures are the wire format; do not reorder fields.

/// "AIKM", little-endian.
pub const MODULE_SIGNATURE: u32 = 0x4D4B_4941;

/// "AIKB", little-endian.
pub const BUNDLE_SIGNATURE: u32 = 0x424B_4941;

/// Byte range of one section, relative to the module base.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct SectionDesc {
    pub offset: u32,
    pub size: u32,
}

/// The 64-byte module image header.
///
/// `version & 0xFFFF` must equal the header size, which doubles as an ABI
/// check. `crc` covers the whole image with this field read as zero.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct ImageHeader {
    pub signature: u32,
    pub version: u32,
    pub binary: SectionDesc,
    pub relocs: SectionDesc,
    pub symbols: SectionDesc,
    pub bss: SectionDesc,
    pub crc: u32,
    pub total_size: u32,
    pub entry_offset: u32,
    pub reserved: [u32; 3],
}

/// One relocation record. `relocs.size` counts records, not bytes.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct RelocationEntry {
    pub offset: u32,
    pub rtype: u32,
    pub section_idx: u32,
    pub symbol_idx: u32,
}

/// One symbol record. `symbols.size` counts records, not bytes.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct SymbolEntry {
    pub value: u32,
    pub section_idx: u32,
    pub stype: u32,
    pub reserved: u32,
}

/// The 32-byte bundle header. A bundle is an offset index over a
/// concatenation of module images.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct BundleHeader {
    pub signature: u32,
    pub module_count: u32,
    pub reserved: [u32; 6],
}

const _: () = assert!(core::mem::size_of::<ImageHeader>() == 64);
const _: () = assert!(core::mem::size_of::<RelocationEntry>() == 16);
const _: () = assert!(core::mem::size_of::<SymbolEntry>() == 16);
const _: () = assert!(core::mem::size_of::<BundleHeader>() == 32);

/// ARM relocation types the loader understands.
pub const R_ARM_NONE: u32 = 0;
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_THM_CALL: u32 = 10;
pub const R_ARM_THM_MOVW_ABS_NC: u32 = 47;
pub const R_ARM_THM_MOVT_ABS: u32 = 48;

/// ELF symbol type for section symbols; ABS32 against one of these adds
/// the addend in place instead of overwriting.
pub const STT_SECTION: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_A: u16 = 1;
    const GROUP_B: u16 = 2;
    const PRIORITY: ConfigKey = ConfigKey::new(GROUP_A, 1 << 0);
    const THRESHOLD: ConfigKey = ConfigKey::new(GROUP_A, 1 << 1);

    #[test]
    fn config_roundtrip_and_absence() {
        let cfg = TaskConfig::new().set(PRIORITY, 2);

        let mut priority = 0u8;
        let mut threshold = 7u8;
        cfg.update(PRIORITY, &mut priority);
        cfg.update(THRESHOLD, &mut threshold);
        assert_eq!(priority, 2);
        // Unset key leaves the default untouched.
        assert_eq!(threshold, 7);
    }

    #[test]
    fn config_last_write_wins() {
        let cfg = TaskConfig::new().set(PRIORITY, 1).set(PRIORITY, 2);
        assert_eq!(cfg.get(PRIORITY), Some(2));
    }

    #[test]
    fn config_value_conversions() {
        const FLAG: ConfigKey = ConfigKey::new(GROUP_B, 1 << 3);
        let cfg = TaskConfig::new().set(FLAG, 1);
        let mut b = false;
        cfg.update(FLAG, &mut b);
        assert!(b);

        let mut w = 0u32;
        cfg.update(FLAG, &mut w);
        assert_eq!(w, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "different policy's key")]
    fn config_cross_group_read_is_caught() {
        let ours = ConfigKey::new(GROUP_A, 1 << 2);
        let theirs = ConfigKey::new(GROUP_B, 1 << 2);
        let cfg = TaskConfig::new().set(ours, 5);
        let _ = cfg.get(theirs);
    }

    #[test]
    fn image_structs_parse_from_bytes() {
        let hdr = ImageHeader {
            signature: MODULE_SIGNATURE,
            version: 64,
            total_size: 64,
            ..Default::default()
        };
        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), 64);
        let back = ImageHeader::read_from_bytes(bytes).unwrap();
        assert_eq!(back.signature, MODULE_SIGNATURE);
        assert_eq!(back.version & 0xFFFF, 64);
    }

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(Syscall::Yield as u32, 1);
        assert_eq!(Syscall::Sleep as u32, 2);
        assert_eq!(Syscall::AddTask as u32, 3);
        assert_eq!(Syscall::from_u32(4), None);
    }
}
