//! Storage resources a calling convention can pass values in.
//!
//! A [`ParamEntry`] is either a single exclusive resource (a register,
//! `alignment == 0`) or a resource sliced into `size / alignment` slots (the
//! stack). Entries in the join space stand for a value split across several
//! other resources and answer containment questions piece by piece.
//!
//! Entries are immutable once their owning model is built. The two
//! cross-entry relationships, join groups and overlap groups, are resolved
//! exactly once by [`ParamEntry::resolve_join`] and
//! [`ParamEntry::resolve_overlap`].

use std::fmt;

use bitflags::bitflags;
use protorec_core::{AddrSpace, Address, JoinRecord, SpaceManager, VarnodeData};

use crate::error::{ProtoError, Result};
use crate::types::TypeClass;

bitflags! {
    /// Boolean properties of a [`ParamEntry`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Values are justified at the low address regardless of endianness.
        const FORCE_LEFT_JUSTIFY = 1 << 0;
        /// Slots are allocated from the high end of the resource.
        const REVERSE_STACK = 1 << 1;
        /// Small values are assumed zero extended to the full slot.
        const SMALLSIZE_ZEXT = 1 << 2;
        /// Small values are assumed sign extended to the full slot.
        const SMALLSIZE_SEXT = 1 << 3;
        /// Small values are extended according to their integer type.
        const SMALLSIZE_INTTYPE = 1 << 4;
        /// Small floating-point values are widened to the full register.
        const SMALLSIZE_FLOATEXT = 1 << 5;
        /// The high piece of a multi-precision value needs extra checks.
        const EXTRACHECK_HIGH = 1 << 6;
        /// The low piece of a multi-precision value needs extra checks.
        const EXTRACHECK_LOW = 1 << 7;
        /// Shares its group with other entries.
        const IS_GROUPED = 1 << 8;
        /// Overlaps earlier entries; its resources are already counted.
        const OVERLAPPING = 1 << 9;
    }
}

/// Implicit extension applied when a small value sits in a larger slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    None,
    Zero,
    Sign,
    /// Zero or sign extension depending on the value's integer type.
    TypeDependent,
}

/// Result of [`ParamEntry::characterize`]-style containment tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Containment {
    /// The range does not overlap any candidate storage.
    None,
    /// The range is inside storage, but not at the justified end.
    ContainsUnjustified,
    /// The range is inside storage, justified.
    ContainsJustified,
    /// The range properly contains some exclusive storage.
    ContainedBy,
}

/// An address handed out by [`ParamEntry::get_addr_by_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddress {
    pub addr: Address,
    /// The value is a small float widened to the full resource.
    pub float_extended: bool,
}

/// One ABI storage resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    flags: EntryFlags,
    type_class: TypeClass,
    groups: Vec<u32>,
    space: AddrSpace,
    base: u64,
    size: u32,
    min_size: u32,
    alignment: u32,
    num_slots: u32,
    join: Option<JoinRecord>,
}

impl ParamEntry {
    /// An exclusive resource, such as a register.
    pub fn exclusive(space: AddrSpace, base: u64, size: u32) -> Self {
        Self {
            flags: EntryFlags::empty(),
            type_class: TypeClass::Unknown,
            groups: Vec::new(),
            space,
            base,
            size,
            min_size: 1,
            alignment: 0,
            num_slots: 1,
            join: None,
        }
    }

    /// A resource sliced into `size / alignment` slots, such as the stack.
    pub fn sliced(space: AddrSpace, base: u64, size: u32, alignment: u32) -> Self {
        let mut entry = Self::exclusive(space, base, size);
        entry.alignment = alignment;
        entry.num_slots = if alignment == 0 { 1 } else { size / alignment };
        entry
    }

    /// A join-space entry; `addr` must have a record in the model's space manager.
    pub fn join(addr: Address, size: u32) -> Self {
        Self::exclusive(addr.space(), addr.offset(), size)
    }

    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_type_class(mut self, class: TypeClass) -> Self {
        self.type_class = class;
        self
    }

    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub(crate) fn set_group(&mut self, group: u32) {
        self.groups = vec![group];
    }

    /// Checks the entry's own attributes.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(ProtoError::bad_abi(format!("entry at {} has no size", self.base_addr())));
        }
        if self.min_size == 0 || self.min_size > self.size {
            return Err(ProtoError::bad_abi(format!(
                "entry at {} has minimum size {} outside 1..={}",
                self.base_addr(),
                self.min_size,
                self.size
            )));
        }
        if self.alignment != 0 && self.size < self.alignment {
            return Err(ProtoError::bad_abi(format!(
                "entry at {} is smaller than its alignment",
                self.base_addr()
            )));
        }
        Ok(())
    }

    // ==================== Accessors ====================

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn type_class(&self) -> TypeClass {
        self.type_class
    }

    /// The first group this entry belongs to.
    pub fn group(&self) -> u32 {
        self.groups.first().copied().unwrap_or(0)
    }

    pub fn all_groups(&self) -> &[u32] {
        &self.groups
    }

    /// Number of groups an exclusive entry consumes.
    pub fn group_size(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Returns true if the two entries share any group.
    pub fn group_overlap(&self, other: &ParamEntry) -> bool {
        self.groups.iter().any(|g| other.groups.contains(g))
    }

    pub fn space(&self) -> AddrSpace {
        self.space
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn base_addr(&self) -> Address {
        Address::new(self.space, self.base)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn join_record(&self) -> Option<&JoinRecord> {
        self.join.as_ref()
    }

    /// Full storage of the entry.
    pub fn storage(&self) -> VarnodeData {
        VarnodeData::new(self.base_addr(), self.size)
    }

    /// An exclusive entry holds a single value.
    pub fn is_exclusion(&self) -> bool {
        self.alignment == 0
    }

    pub fn is_reverse_stack(&self) -> bool {
        self.flags.contains(EntryFlags::REVERSE_STACK)
    }

    pub fn is_grouped(&self) -> bool {
        self.flags.contains(EntryFlags::IS_GROUPED)
    }

    pub fn is_overlap(&self) -> bool {
        self.flags.contains(EntryFlags::OVERLAPPING)
    }

    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    pub fn is_left_justified(&self) -> bool {
        self.flags.contains(EntryFlags::FORCE_LEFT_JUSTIFY) || !self.space.is_big_endian()
    }

    pub fn is_param_check_high(&self) -> bool {
        self.flags.contains(EntryFlags::EXTRACHECK_HIGH)
    }

    pub fn is_param_check_low(&self) -> bool {
        self.flags.contains(EntryFlags::EXTRACHECK_LOW)
    }

    // ==================== Containment ====================

    fn end(&self) -> u64 {
        self.base + u64::from(self.size) - 1
    }

    fn range_within(space: AddrSpace, start: u64, size: u32, addr: &Address, sz: u32) -> bool {
        if space != addr.space() || sz == 0 {
            return false;
        }
        let end = start + u64::from(size) - 1;
        let range_end = addr.offset().saturating_add(u64::from(sz) - 1);
        start >= addr.offset() && end <= range_end
    }

    fn ranges_intersect(space: AddrSpace, start: u64, size: u32, addr: &Address, sz: u32) -> bool {
        if space != addr.space() || sz == 0 {
            return false;
        }
        let end = start + u64::from(size) - 1;
        let range_end = addr.offset().saturating_add(u64::from(sz) - 1);
        addr.offset() <= end && start <= range_end
    }

    /// Returns true if the whole entry lies within `[addr, addr+sz)`.
    pub fn contained_by(&self, addr: &Address, sz: u32) -> bool {
        match &self.join {
            Some(rec) => rec
                .pieces()
                .iter()
                .all(|p| Self::range_within(p.space(), p.offset(), p.size, addr, sz)),
            None => Self::range_within(self.space, self.base, self.size, addr, sz),
        }
    }

    /// Returns true if the entry shares any byte with `[addr, addr+sz)`.
    pub fn intersects(&self, addr: &Address, sz: u32) -> bool {
        match &self.join {
            Some(rec) => rec
                .pieces()
                .iter()
                .any(|p| Self::ranges_intersect(p.space(), p.offset(), p.size, addr, sz)),
            None => Self::ranges_intersect(self.space, self.base, self.size, addr, sz),
        }
    }

    /// Returns true if `other` lies entirely within this entry. Join entries
    /// never contain, nor are contained by, other entries.
    pub fn contains(&self, other: &ParamEntry) -> bool {
        if self.join.is_some() || other.join.is_some() {
            return false;
        }
        if self.space != other.space || other.base < self.base {
            return false;
        }
        other.end() <= self.end()
    }

    /// Byte offset of `[addr, addr+sz)` within the entry, counted from the
    /// justified end, or `None` if the range is not contained.
    pub fn justified_contain(&self, addr: &Address, sz: u32) -> Option<u32> {
        if let Some(rec) = &self.join {
            let mut res = 0;
            for piece in rec.pieces().iter().rev() {
                match piece.addr.justified_contain(piece.size, addr, sz, false) {
                    Some(cur) => return Some(res + cur),
                    None => res += piece.size,
                }
            }
            return None;
        }
        if self.alignment == 0 {
            let force_left = self.flags.contains(EntryFlags::FORCE_LEFT_JUSTIFY);
            return self.base_addr().justified_contain(self.size, addr, sz, force_left);
        }
        if self.space != addr.space() || sz == 0 {
            return None;
        }
        let start = addr.offset();
        if start < self.base {
            return None;
        }
        let end = start.checked_add(u64::from(sz) - 1)?;
        if end > self.end() {
            return None;
        }
        let start = start - self.base;
        let end = end - self.base;
        let align = u64::from(self.alignment);
        if !self.is_left_justified() {
            let res = (end + 1) % align;
            if res == 0 {
                return Some(0);
            }
            return Some((align - res) as u32);
        }
        Some((start % align) as u32)
    }

    /// The full storage unit backing the sub-range `[addr, addr+sz)`.
    pub fn get_container(&self, addr: &Address, sz: u32) -> Option<VarnodeData> {
        let end_addr = addr.add(i64::from(sz) - 1);
        if let Some(rec) = &self.join {
            return rec
                .pieces()
                .iter()
                .rev()
                .find(|p| {
                    addr.overlap(0, &p.addr, p.size).is_some()
                        && end_addr.overlap(0, &p.addr, p.size).is_some()
                })
                .copied();
        }
        let entry = self.base_addr();
        addr.overlap(0, &entry, self.size)?;
        end_addr.overlap(0, &entry, self.size)?;
        if self.alignment == 0 {
            return Some(self.storage());
        }
        let align = u64::from(self.alignment);
        let al = (addr.offset() - self.base) % align;
        let offset = addr.offset() - al;
        let mut size = (end_addr.offset() - offset) as u32 + 1;
        let al2 = size % self.alignment;
        if al2 != 0 {
            size += self.alignment - al2;
        }
        Some(VarnodeData::new(Address::new(self.space, offset), size))
    }

    /// Extension assumed when a value of `sz` bytes at `addr` is read from
    /// this entry, plus the container it is extended to.
    pub fn assumed_extension(&self, addr: &Address, sz: u32) -> (Extension, Option<VarnodeData>) {
        let ext_flags =
            EntryFlags::SMALLSIZE_ZEXT | EntryFlags::SMALLSIZE_SEXT | EntryFlags::SMALLSIZE_INTTYPE;
        if !self.flags.intersects(ext_flags) {
            return (Extension::None, None);
        }
        if self.alignment != 0 {
            if sz >= self.alignment {
                return (Extension::None, None);
            }
        } else if sz >= self.size {
            return (Extension::None, None);
        }
        if self.justified_contain(addr, sz) != Some(0) {
            return (Extension::None, None);
        }
        let container = if self.alignment == 0 {
            self.storage()
        } else {
            let adjust = (addr.offset() - self.base) % u64::from(self.alignment);
            VarnodeData::new(Address::new(self.space, addr.offset() - adjust), self.alignment)
        };
        let kind = if self.flags.contains(EntryFlags::SMALLSIZE_ZEXT) {
            Extension::Zero
        } else if self.flags.contains(EntryFlags::SMALLSIZE_INTTYPE) {
            Extension::TypeDependent
        } else {
            Extension::Sign
        };
        (kind, Some(container))
    }

    /// Group (slot number across the whole model) that `addr + skip` falls in.
    ///
    /// For exclusive entries any non-zero `skip` selects the last group the
    /// entry covers.
    pub fn get_slot(&self, addr: &Address, skip: u32) -> u32 {
        let mut res = self.group();
        if self.alignment != 0 {
            let diff = addr
                .offset()
                .wrapping_add(u64::from(skip))
                .wrapping_sub(self.base);
            let base_slot = (diff / u64::from(self.alignment)) as u32;
            if self.is_reverse_stack() {
                res += (self.num_slots - 1).saturating_sub(base_slot);
            } else {
                res += base_slot;
            }
        } else if skip != 0 {
            res = self.groups.last().copied().unwrap_or(res);
        }
        res
    }

    /// Allocates storage for a `sz`-byte value starting at slot `*slotnum`.
    ///
    /// On success `*slotnum` is advanced past the slots consumed. Returns
    /// `None` if the value does not fit.
    pub fn get_addr_by_slot(&self, slotnum: &mut u32, sz: u32, type_align: u32) -> Option<SlotAddress> {
        if sz < self.min_size {
            return None;
        }
        let mut float_extended = false;
        let space_used;
        let mut addr;
        if self.alignment == 0 {
            if *slotnum != 0 || sz > self.size {
                return None;
            }
            addr = self.base_addr();
            space_used = self.size;
            if self.flags.contains(EntryFlags::SMALLSIZE_FLOATEXT) && sz != self.size {
                float_extended = true;
            }
        } else {
            if type_align > self.alignment {
                let tmp = (*slotnum * self.alignment) % type_align;
                if tmp != 0 {
                    *slotnum += (type_align - tmp) / self.alignment;
                }
            }
            let slots_used = sz.div_ceil(self.alignment);
            if *slotnum + slots_used > self.num_slots {
                return None;
            }
            space_used = slots_used * self.alignment;
            let index = if self.is_reverse_stack() {
                self.num_slots - *slotnum - slots_used
            } else {
                *slotnum
            };
            addr = Address::new(self.space, self.base + u64::from(index * self.alignment));
            *slotnum += slots_used;
        }
        if !float_extended && !self.is_left_justified() {
            addr = addr.add(i64::from(space_used - sz));
        }
        Some(SlotAddress {
            addr,
            float_extended,
        })
    }

    // ==================== Model construction ====================

    /// Binds a join-space entry to its record, inheriting the groups of the
    /// earlier entries whose storage makes up its pieces.
    pub fn resolve_join(&mut self, earlier: &[ParamEntry], spaces: &SpaceManager) -> Result<()> {
        if !self.space.is_join() {
            self.join = None;
            return Ok(());
        }
        let rec = spaces
            .find_join(self.base)
            .map_err(|_| ProtoError::bad_abi(format!("no join record for entry at {}", self.base_addr())))?
            .clone();
        let mut groups = Vec::new();
        for (i, piece) in rec.pieces().iter().enumerate() {
            let found = earlier
                .iter()
                .rev()
                .find(|e| e.join.is_none() && e.space == piece.space() && e.base == piece.offset() && e.size == piece.size);
            if let Some(entry) = found {
                groups.extend_from_slice(&entry.groups);
                // The half backed by an earlier entry is trusted; the other half is checked.
                self.flags |= if i == 0 {
                    EntryFlags::EXTRACHECK_LOW
                } else {
                    EntryFlags::EXTRACHECK_HIGH
                };
            }
        }
        if groups.is_empty() {
            return Err(ProtoError::bad_abi(format!(
                "join entry at {} does not cover any parameter entry",
                self.base_addr()
            )));
        }
        groups.sort_unstable();
        groups.dedup();
        self.groups = groups;
        self.join = Some(rec);
        self.flags |= EntryFlags::OVERLAPPING;
        Ok(())
    }

    /// Merges this entry into the groups of earlier entries it overlaps.
    /// Partial overlap is a configuration error.
    pub fn resolve_overlap(&mut self, earlier: &[ParamEntry]) -> Result<()> {
        if self.join.is_some() {
            return Ok(());
        }
        let addr = self.base_addr();
        let mut overlap_set = Vec::new();
        for entry in earlier {
            if !entry.intersects(&addr, self.size) {
                continue;
            }
            if !self.contains(entry) {
                if entry.is_join() {
                    continue;
                }
                return Err(ProtoError::bad_abi(format!(
                    "illegal overlap of entries at {} and {}",
                    entry.base_addr(),
                    addr
                )));
            }
            if entry.is_overlap() {
                continue;
            }
            overlap_set.extend_from_slice(&entry.groups);
            let same_base = self.base == entry.base;
            let big_endian = self.space.is_big_endian();
            self.flags |= match (same_base, big_endian) {
                (true, true) | (false, false) => EntryFlags::EXTRACHECK_LOW,
                (true, false) | (false, true) => EntryFlags::EXTRACHECK_HIGH,
            };
        }
        if overlap_set.is_empty() {
            return Ok(());
        }
        overlap_set.sort_unstable();
        overlap_set.dedup();
        self.groups = overlap_set;
        self.flags |= EntryFlags::OVERLAPPING;
        Ok(())
    }
}

impl fmt::Display for ParamEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base_addr(), self.size)?;
        if self.alignment != 0 {
            write!(f, " align={}", self.alignment)?;
        }
        write!(f, " group={}", self.group())
    }
}
