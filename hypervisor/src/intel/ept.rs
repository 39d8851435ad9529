//! The guest-physical → host-physical translation hierarchy.
//!
//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//!
//! Four levels, each its own physically contiguous allocation: one page for
//! the PML4, the PDPT and the PD, and an array of 512 page tables for the
//! leaf level. Every entry of every level is populated before the guest is
//! entered: the upper levels point uniformly one level down and leaf entry
//! `i` maps guest-physical page `i` onto the flat guest allocation.

use {
    crate::{
        error::HypervisorError,
        intel::vcpu::release_slot,
        utils::{addresses::PhysicalAddress, alloc::PhysicalAllocator},
    },
    alloc::boxed::Box,
    bit_field::BitField,
    static_assertions::const_assert_eq,
};

pub const PAGE_SIZE: usize = 0x1000;

/// Entries per table at every level.
pub const TABLE_ENTRY_COUNT: usize = 512;

/// Page tables making up the leaf level, covering 512 * 512 guest pages.
pub const LEAF_TABLE_COUNT: usize = 512;

/// EPT paging-structure memory types.
///
/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.7 EPT and Memory Typing
#[derive(Debug, Clone, Copy)]
pub enum EptMemoryType {
    Uncacheable = 0,
    WriteBack = 6,
}

/// A single EPT paging-structure entry, at any level.
///
/// 29.3.2 EPT Translation Mechanism
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    pub const fn new() -> Self {
        EptEntry(0)
    }

    /// Sets the read-access bit.
    pub fn set_read(&mut self, read: bool) {
        self.0.set_bit(0, read);
    }

    /// Sets the write-access bit.
    pub fn set_write(&mut self, write: bool) {
        self.0.set_bit(1, write);
    }

    /// Sets the execute-access bit.
    pub fn set_execute(&mut self, execute: bool) {
        self.0.set_bit(2, execute);
    }

    /// Sets the memory type of a leaf entry.
    pub fn set_memory_type(&mut self, memory_type: EptMemoryType) {
        self.0.set_bits(3..=5, memory_type as u64);
    }

    /// Sets the physical address this entry points at (next level base or
    /// mapped page).
    pub fn set_address(&mut self, address: u64) {
        self.0.set_bits(12..=51, address >> 12);
    }

    /// The physical address this entry points at.
    pub fn address(&self) -> u64 {
        self.0.get_bits(12..=51) << 12
    }

    /// Whether any access is permitted through this entry.
    pub fn is_present(&self) -> bool {
        self.0.get_bits(0..=2) != 0
    }

    /// Whether the entry grants read, write and execute access.
    pub fn is_read_write_execute(&self) -> bool {
        self.0.get_bits(0..=2) == 0b111
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// One page worth of EPT entries.
#[repr(C, align(4096))]
pub struct EptTable {
    pub entries: [EptEntry; TABLE_ENTRY_COUNT],
}
const_assert_eq!(core::mem::size_of::<EptTable>(), PAGE_SIZE);

impl EptTable {
    pub const fn new() -> Self {
        Self {
            entries: [EptEntry::new(); TABLE_ENTRY_COUNT],
        }
    }
}

/// The leaf level: 512 page tables mapping the guest page-by-page.
pub type EptLeafTables = [EptTable; LEAF_TABLE_COUNT];

/// The extended-page-table pointer installed into the VMCS.
///
/// 25.6.11 Extended-Page-Table Pointer (EPTP): Table 25-9. Format of Extended-Page-Table Pointer
#[derive(Debug, Clone, Copy)]
pub struct Eptp(u64);

impl Eptp {
    /// Encodes the pointer for a 4-level hierarchy rooted at `pml4_pa`,
    /// write-back paging-structure memory type, accessed/dirty tracking on.
    pub fn new(pml4_pa: u64) -> Self {
        let mut eptp = 0u64;
        eptp.set_bits(0..=2, EptMemoryType::WriteBack as u64);
        // Encoded as "page-walk length minus one".
        eptp.set_bits(3..=5, 3);
        eptp.set_bit(6, true);
        eptp.set_bits(12..=51, pml4_pa >> 12);
        Self(eptp)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// The four owned translation levels.
///
/// Built once per launch cycle and released together with guest memory,
/// each level independently.
pub struct Ept {
    pml4: Option<Box<EptTable, PhysicalAllocator>>,
    pml3: Option<Box<EptTable, PhysicalAllocator>>,
    pml2: Option<Box<EptTable, PhysicalAllocator>>,
    pml1: Option<Box<EptLeafTables, PhysicalAllocator>>,
}

impl Ept {
    pub const fn new() -> Self {
        Self {
            pml4: None,
            pml3: None,
            pml2: None,
            pml1: None,
        }
    }

    /// Allocates and wires the whole hierarchy over the guest allocation at
    /// `guest_memory_pa`, returning the physical base of the top level for
    /// the VMCS translation-pointer field.
    ///
    /// The hierarchy is only stored (and thus only reachable by a guest
    /// entry) once every level is fully populated.
    pub fn build(&mut self, guest_memory_pa: u64) -> Result<u64, HypervisorError> {
        let mut pml4 = Self::allocate_table("EPT PML4 table")?;
        let mut pml3 = Self::allocate_table("EPT PDPT")?;
        let mut pml2 = Self::allocate_table("EPT page directory")?;
        let mut pml1: Box<EptLeafTables, PhysicalAllocator> = unsafe {
            Box::try_new_zeroed_in(PhysicalAllocator)
                .map_err(|_| HypervisorError::MemoryAllocationFailed("EPT page tables"))?
                .assume_init()
        };

        let pml4_pa = Self::table_pa(pml4.as_ref())?;
        let pml3_pa = Self::table_pa(pml3.as_ref())?;
        let pml2_pa = Self::table_pa(pml2.as_ref())?;
        let pml1_pa = PhysicalAddress::pa_from_va(pml1.as_ptr() as _);
        if pml1_pa == 0 {
            return Err(HypervisorError::VirtualToPhysicalAddressFailed);
        }

        log::info!("EPT PML4 at {:#x}, PDPT at {:#x}, PD at {:#x}, page tables at {:#x}", pml4_pa, pml3_pa, pml2_pa, pml1_pa);

        Self::wire_level(&mut pml4, pml3_pa);
        Self::wire_level(&mut pml3, pml2_pa);
        Self::wire_directory(&mut pml2, pml1_pa);
        Self::wire_leaf_tables(pml1.as_mut_slice(), guest_memory_pa);

        self.pml4 = Some(pml4);
        self.pml3 = Some(pml3);
        self.pml2 = Some(pml2);
        self.pml1 = Some(pml1);

        Ok(pml4_pa)
    }

    /// Releases every level independently; missing levels are reported and
    /// skipped.
    pub fn release(&mut self) {
        release_slot(&mut self.pml4, "EPT PML4 table");
        release_slot(&mut self.pml3, "EPT PDPT");
        release_slot(&mut self.pml2, "EPT page directory");
        release_slot(&mut self.pml1, "EPT page tables");
    }

    fn allocate_table(name: &'static str) -> Result<Box<EptTable, PhysicalAllocator>, HypervisorError> {
        unsafe {
            Ok(Box::try_new_zeroed_in(PhysicalAllocator)
                .map_err(|_| HypervisorError::MemoryAllocationFailed(name))?
                .assume_init())
        }
    }

    fn table_pa(table: &EptTable) -> Result<u64, HypervisorError> {
        let pa = PhysicalAddress::pa_from_va(table as *const _ as _);
        if pa == 0 {
            return Err(HypervisorError::VirtualToPhysicalAddressFailed);
        }
        Ok(pa)
    }

    /// Points every entry of `table` at the single next-level table,
    /// read/write/execute.
    fn wire_level(table: &mut EptTable, next_level_pa: u64) {
        for entry in table.entries.iter_mut() {
            entry.set_read(true);
            entry.set_write(true);
            entry.set_execute(true);
            entry.set_address(next_level_pa);
        }
    }

    /// Fans the directory out over the contiguous array of leaf tables:
    /// entry `i` points at the `i`-th page table.
    fn wire_directory(table: &mut EptTable, leaf_tables_pa: u64) {
        for (i, entry) in table.entries.iter_mut().enumerate() {
            entry.set_read(true);
            entry.set_write(true);
            entry.set_execute(true);
            entry.set_address(leaf_tables_pa + (i * PAGE_SIZE) as u64);
        }
    }

    /// Maps the flat guest-physical range page by page onto the guest
    /// allocation.
    fn wire_leaf_tables(tables: &mut [EptTable], guest_memory_pa: u64) {
        for (i, table) in tables.iter_mut().enumerate() {
            for (j, entry) in table.entries.iter_mut().enumerate() {
                let page_index = i * TABLE_ENTRY_COUNT + j;
                entry.set_read(true);
                entry.set_write(true);
                entry.set_execute(true);
                entry.set_memory_type(EptMemoryType::Uncacheable);
                entry.set_address(guest_memory_pa + (page_index * PAGE_SIZE) as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wired_level_is_fully_populated() {
        let mut table = EptTable::new();
        Ept::wire_level(&mut table, 0x4000);

        for entry in table.entries.iter() {
            assert_ne!(entry.raw(), 0);
            assert!(entry.is_read_write_execute());
            assert_eq!(entry.address(), 0x4000);
        }
    }

    #[test]
    fn directory_fans_out_across_leaf_tables() {
        let mut table = EptTable::new();
        Ept::wire_directory(&mut table, 0x10_0000);

        for (i, entry) in table.entries.iter().enumerate() {
            assert!(entry.is_read_write_execute());
            assert_eq!(entry.address(), 0x10_0000 + (i * PAGE_SIZE) as u64);
        }
    }

    #[test]
    fn leaf_tables_map_the_guest_page_by_page() {
        let mut tables: alloc::vec::Vec<EptTable> = (0..4).map(|_| EptTable::new()).collect();
        Ept::wire_leaf_tables(&mut tables, 0x20_0000);

        for (i, table) in tables.iter().enumerate() {
            for (j, entry) in table.entries.iter().enumerate() {
                assert_ne!(entry.raw(), 0);
                assert!(entry.is_read_write_execute());
                let page_index = (i * TABLE_ENTRY_COUNT + j) as u64;
                assert_eq!(entry.address(), 0x20_0000 + page_index * PAGE_SIZE as u64);
            }
        }
    }

    #[test]
    fn eptp_encoding() {
        // Write-back (6), 4-level walk encoded as 3, accessed/dirty enabled.
        let eptp = Eptp::new(0x1000);
        assert_eq!(eptp.raw(), 0x1000 | 0b100_0110);
    }

    #[test]
    fn eptp_keeps_the_page_frame_only() {
        let eptp = Eptp::new(0xdead_b000);
        assert_eq!(eptp.raw() & !0xfff, 0xdead_b000);
    }
}
