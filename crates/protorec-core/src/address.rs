//! Address spaces, addresses and storage descriptors.
//!
//! Every storage location the decompiler reasons about (a register, a stack
//! slot, a temporary, a constant) is an offset within an [`AddrSpace`].
//! Parameter recovery only needs enough of this model to do containment
//! arithmetic: which byte of one range a second range starts at, counted
//! from the significant end, and whether two ranges abut.
//!
//! Values split across several physical locations live in the special join
//! space; their layout is described by a [`JoinRecord`] owned by the
//! [`SpaceManager`].

use std::fmt;

use crate::error::{Error, Result};

/// The role an address space plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpaceKind {
    /// Constants; the offset is the value.
    Constant,
    /// Registers or RAM.
    Processor,
    /// A space relative to a base register (the stack).
    Spacebase,
    /// Compiler temporaries.
    Internal,
    /// Logical values formed by joining several pieces of storage.
    Join,
}

/// A handle to an address space.
///
/// Spaces are small value types so that an [`Address`] can answer
/// endianness and wrapping questions without consulting a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AddrSpace {
    index: u16,
    kind: SpaceKind,
    big_endian: bool,
    addr_size: u8,
    name: &'static str,
}

impl AddrSpace {
    /// Creates a space handle.
    pub const fn new(
        index: u16,
        name: &'static str,
        kind: SpaceKind,
        big_endian: bool,
        addr_size: u8,
    ) -> Self {
        Self {
            index,
            kind,
            big_endian,
            addr_size,
            name,
        }
    }

    /// Index of the space within its manager.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Name of the space.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Kind of the space.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns true if multi-byte values are stored most significant byte first.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Size of an offset in bytes.
    pub fn addr_size(&self) -> u8 {
        self.addr_size
    }

    pub fn is_spacebase(&self) -> bool {
        self.kind == SpaceKind::Spacebase
    }

    pub fn is_join(&self) -> bool {
        self.kind == SpaceKind::Join
    }

    pub fn is_internal(&self) -> bool {
        self.kind == SpaceKind::Internal
    }

    pub fn is_constant(&self) -> bool {
        self.kind == SpaceKind::Constant
    }

    /// Wraps an offset to the size of this space.
    pub fn wrap_offset(&self, offset: u64) -> u64 {
        if self.addr_size >= 8 {
            offset
        } else {
            offset & ((1u64 << (u32::from(self.addr_size) * 8)) - 1)
        }
    }

    /// Reads an offset as a two's complement value of this space's width.
    pub fn signed_offset(&self, offset: u64) -> i64 {
        let bits = u32::from(self.addr_size.clamp(1, 8)) * 8;
        let shift = 64 - bits;
        ((self.wrap_offset(offset) << shift) as i64) >> shift
    }
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A byte address within a specific space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Address {
    space: AddrSpace,
    offset: u64,
}

impl Address {
    /// Creates an address, wrapping the offset to the space size.
    pub fn new(space: AddrSpace, offset: u64) -> Self {
        Self {
            space,
            offset: space.wrap_offset(offset),
        }
    }

    pub fn space(&self) -> AddrSpace {
        self.space
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns this address displaced by `delta` bytes, wrapping within the space.
    pub fn add(&self, delta: i64) -> Self {
        Self::new(self.space, self.offset.wrapping_add(delta as u64))
    }

    /// Returns the offset of `self + skip` within the range `[base, base+size)`.
    pub fn overlap(&self, skip: i64, base: &Address, size: u32) -> Option<u32> {
        if self.space != base.space || self.space.is_constant() {
            return None;
        }
        let dist = self
            .space
            .wrap_offset(self.offset.wrapping_add(skip as u64).wrapping_sub(base.offset));
        if dist >= u64::from(size) {
            None
        } else {
            Some(dist as u32)
        }
    }

    /// Position of the range `(other, other_size)` inside `(self, size)`.
    ///
    /// The position is counted from the least significant end of the
    /// containing range: the high address for big-endian spaces (unless
    /// `force_left` is set), the low address otherwise.
    pub fn justified_contain(
        &self,
        size: u32,
        other: &Address,
        other_size: u32,
        force_left: bool,
    ) -> Option<u32> {
        if self.space != other.space || size == 0 || other_size == 0 {
            return None;
        }
        if other.offset < self.offset {
            return None;
        }
        let end = self.offset.checked_add(u64::from(size) - 1)?;
        let other_end = other.offset.checked_add(u64::from(other_size) - 1)?;
        if other_end > end {
            return None;
        }
        if self.space.is_big_endian() && !force_left {
            Some((end - other_end) as u32)
        } else {
            Some((other.offset - self.offset) as u32)
        }
    }

    /// Returns true if `(self, size)` lies entirely within `(other, other_size)`.
    pub fn contained_by(&self, size: u32, other: &Address, other_size: u32) -> bool {
        if self.space != other.space || size == 0 || other_size == 0 {
            return false;
        }
        if other.offset > self.offset {
            return false;
        }
        let end = self.offset.saturating_add(u64::from(size) - 1);
        let other_end = other.offset.saturating_add(u64::from(other_size) - 1);
        end <= other_end
    }

    /// Returns true if `(self, size)` is the high half of a value whose low
    /// half is `(lo, lo_size)`, with no gap between the two.
    pub fn is_contiguous(&self, size: u32, lo: &Address, lo_size: u32) -> bool {
        if self.space != lo.space {
            return false;
        }
        if self.space.is_big_endian() {
            self.space
                .wrap_offset(self.offset.wrapping_add(u64::from(size)))
                == lo.offset
        } else {
            self.space
                .wrap_offset(lo.offset.wrapping_add(u64::from(lo_size)))
                == self.offset
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space, self.offset)
    }
}

/// A contiguous range of storage: start address and byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VarnodeData {
    pub addr: Address,
    pub size: u32,
}

impl VarnodeData {
    pub fn new(addr: Address, size: u32) -> Self {
        Self { addr, size }
    }

    pub fn space(&self) -> AddrSpace {
        self.addr.space()
    }

    pub fn offset(&self) -> u64 {
        self.addr.offset()
    }

    /// Returns true if `other` lies entirely within this range.
    pub fn contains(&self, other: &VarnodeData) -> bool {
        other.addr.contained_by(other.size, &self.addr, self.size)
    }
}

impl fmt::Display for VarnodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.addr, self.size)
    }
}

/// Layout of a logical value split across several storage locations.
///
/// Pieces are listed from most significant to least significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pieces: Vec<VarnodeData>,
    unified: VarnodeData,
}

impl JoinRecord {
    pub fn pieces(&self) -> &[VarnodeData] {
        &self.pieces
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, i: usize) -> Option<&VarnodeData> {
        self.pieces.get(i)
    }

    /// The join-space storage standing for the whole value.
    pub fn unified(&self) -> &VarnodeData {
        &self.unified
    }
}

/// Registry of address spaces and join records for one program.
#[derive(Debug, Clone)]
pub struct SpaceManager {
    spaces: Vec<AddrSpace>,
    joins: Vec<JoinRecord>,
    next_join_offset: u64,
    big_endian: bool,
    addr_size: u8,
}

impl SpaceManager {
    const CONSTANT: u16 = 0;
    const UNIQUE: u16 = 1;
    const JOIN: u16 = 2;

    /// Creates a manager holding only the constant, unique and join spaces.
    pub fn new(big_endian: bool, addr_size: u8) -> Self {
        let spaces = vec![
            AddrSpace::new(Self::CONSTANT, "const", SpaceKind::Constant, big_endian, 8),
            AddrSpace::new(Self::UNIQUE, "unique", SpaceKind::Internal, big_endian, 4),
            AddrSpace::new(Self::JOIN, "join", SpaceKind::Join, big_endian, 4),
        ];
        Self {
            spaces,
            joins: Vec::new(),
            next_join_offset: 0x10,
            big_endian,
            addr_size,
        }
    }

    /// Creates a manager with `register`, `ram` and `stack` spaces added.
    pub fn standard(big_endian: bool, addr_size: u8) -> Self {
        let mut manager = Self::new(big_endian, addr_size);
        manager.add_space("register", SpaceKind::Processor);
        manager.add_space("ram", SpaceKind::Processor);
        manager.add_space("stack", SpaceKind::Spacebase);
        manager
    }

    /// Registers a new space and returns its handle.
    pub fn add_space(&mut self, name: &'static str, kind: SpaceKind) -> AddrSpace {
        let space = AddrSpace::new(
            self.spaces.len() as u16,
            name,
            kind,
            self.big_endian,
            self.addr_size,
        );
        self.spaces.push(space);
        space
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn spaces(&self) -> &[AddrSpace] {
        &self.spaces
    }

    pub fn space_by_name(&self, name: &str) -> Option<AddrSpace> {
        self.spaces.iter().copied().find(|s| s.name() == name)
    }

    pub fn space_by_index(&self, index: u16) -> Option<AddrSpace> {
        self.spaces.get(usize::from(index)).copied()
    }

    pub fn constant_space(&self) -> AddrSpace {
        self.spaces[usize::from(Self::CONSTANT)]
    }

    pub fn unique_space(&self) -> AddrSpace {
        self.spaces[usize::from(Self::UNIQUE)]
    }

    pub fn join_space(&self) -> AddrSpace {
        self.spaces[usize::from(Self::JOIN)]
    }

    /// The first spacebase (stack) space, if any.
    pub fn stack_space(&self) -> Option<AddrSpace> {
        self.spaces.iter().copied().find(AddrSpace::is_spacebase)
    }

    /// Returns the join address for the given pieces (most significant
    /// first), creating a new record if none matches.
    pub fn construct_join_address(&mut self, pieces: &[VarnodeData]) -> Address {
        if let Some(rec) = self.joins.iter().find(|rec| rec.pieces == pieces) {
            return rec.unified.addr;
        }
        let total: u32 = pieces.iter().map(|p| p.size).sum();
        let addr = Address::new(self.join_space(), self.next_join_offset);
        self.next_join_offset += (u64::from(total) + 0xf) & !0xf;
        self.joins.push(JoinRecord {
            pieces: pieces.to_vec(),
            unified: VarnodeData::new(addr, total),
        });
        addr
    }

    /// Join address for a two-piece value.
    pub fn construct_join_pair(
        &mut self,
        hi: Address,
        hi_size: u32,
        lo: Address,
        lo_size: u32,
    ) -> Address {
        self.construct_join_address(&[VarnodeData::new(hi, hi_size), VarnodeData::new(lo, lo_size)])
    }

    /// Looks up the join record starting at `offset` in the join space.
    pub fn find_join(&self, offset: u64) -> Result<&JoinRecord> {
        self.joins
            .iter()
            .find(|rec| rec.unified.offset() == offset)
            .ok_or(Error::UnknownJoin(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> AddrSpace {
        AddrSpace::new(3, "register", SpaceKind::Processor, false, 4)
    }

    fn reg_be() -> AddrSpace {
        AddrSpace::new(3, "register", SpaceKind::Processor, true, 4)
    }

    #[test]
    fn test_wrap_offset() {
        let space = reg();
        assert_eq!(space.wrap_offset(0x1_0000_0004), 4);
        let wide = AddrSpace::new(4, "ram", SpaceKind::Processor, false, 8);
        assert_eq!(wide.wrap_offset(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_signed_offset() {
        let space = reg();
        assert_eq!(space.signed_offset(0x10), 0x10);
        assert_eq!(space.signed_offset(0xffff_fffc), -4);
        assert_eq!(space.signed_offset(0x1_0000_0004), 4);
        let wide = AddrSpace::new(4, "ram", SpaceKind::Processor, false, 8);
        assert_eq!(wide.signed_offset(u64::MAX), -1);
    }

    #[test]
    fn test_overlap() {
        let base = Address::new(reg(), 0x10);
        assert_eq!(Address::new(reg(), 0x12).overlap(0, &base, 4), Some(2));
        assert_eq!(Address::new(reg(), 0x14).overlap(0, &base, 4), None);
        assert_eq!(Address::new(reg(), 0x0f).overlap(1, &base, 4), Some(0));
    }

    #[test]
    fn test_justified_contain_little_endian() {
        let whole = Address::new(reg(), 0x20);
        assert_eq!(whole.justified_contain(8, &Address::new(reg(), 0x20), 4, false), Some(0));
        assert_eq!(whole.justified_contain(8, &Address::new(reg(), 0x24), 4, false), Some(4));
        assert_eq!(whole.justified_contain(8, &Address::new(reg(), 0x26), 4, false), None);
    }

    #[test]
    fn test_justified_contain_big_endian() {
        let whole = Address::new(reg_be(), 0x20);
        // Least significant end is the high address.
        assert_eq!(whole.justified_contain(8, &Address::new(reg_be(), 0x24), 4, false), Some(0));
        assert_eq!(whole.justified_contain(8, &Address::new(reg_be(), 0x20), 4, false), Some(4));
        assert_eq!(whole.justified_contain(8, &Address::new(reg_be(), 0x20), 4, true), Some(0));
    }

    #[test]
    fn test_contained_by() {
        let a = Address::new(reg(), 4);
        assert!(a.contained_by(4, &Address::new(reg(), 0), 8));
        assert!(!a.contained_by(8, &Address::new(reg(), 0), 8));
        assert!(!a.contained_by(4, &Address::new(reg(), 6), 8));
    }

    #[test]
    fn test_is_contiguous() {
        let hi = Address::new(reg(), 4);
        let lo = Address::new(reg(), 0);
        assert!(hi.is_contiguous(4, &lo, 4));
        assert!(!lo.is_contiguous(4, &hi, 4));

        let hi_be = Address::new(reg_be(), 0);
        let lo_be = Address::new(reg_be(), 4);
        assert!(hi_be.is_contiguous(4, &lo_be, 4));
    }

    #[test]
    fn test_join_records_are_shared() {
        let mut manager = SpaceManager::standard(false, 4);
        let regs = manager.space_by_name("register").unwrap();
        let hi = Address::new(regs, 4);
        let lo = Address::new(regs, 0);
        let a = manager.construct_join_pair(hi, 4, lo, 4);
        let b = manager.construct_join_pair(hi, 4, lo, 4);
        assert_eq!(a, b);
        assert!(a.space().is_join());

        let rec = manager.find_join(a.offset()).unwrap();
        assert_eq!(rec.num_pieces(), 2);
        assert_eq!(rec.unified().size, 8);
        assert_eq!(rec.piece(0).unwrap().addr, hi);

        let c = manager.construct_join_pair(lo, 4, hi, 4);
        assert_ne!(a, c);
        assert!(manager.find_join(0x999).is_err());
    }

    #[test]
    fn test_standard_spaces() {
        let manager = SpaceManager::standard(false, 4);
        assert!(manager.constant_space().is_constant());
        assert!(manager.unique_space().is_internal());
        assert!(manager.stack_space().unwrap().is_spacebase());
        assert_eq!(manager.space_by_index(3).unwrap().name(), "register");
    }
}
