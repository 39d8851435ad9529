//! Resolution of segment descriptors out of the live GDT.
//!
//! The control-field initializer needs the task register's base address for
//! the host and guest TR fields; everything else about the guest's segments
//! is written from fixed encodings.

use {
    bit_field::BitField,
    x86::{dtables::DescriptorTablePointer, segmentation::SegmentSelector},
    x86_64::structures::gdt::DescriptorFlags,
};

/// A segment descriptor's properties as resolved from the GDT.
pub struct SegmentDescriptor {
    /// The starting address of the segment.
    pub base_address: u64,
}

impl SegmentDescriptor {
    /// Looks `selector` up in the table behind `gdtr` and extracts the base.
    ///
    /// System segments (the TSS among them) span two table entries in
    /// IA-32e mode; the upper half of their base comes from the second one.
    /// A null or non-present selector resolves to base 0.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
    pub fn from_selector(selector: SegmentSelector, gdtr: &DescriptorTablePointer<u64>) -> Self {
        let index = selector.index() as usize;
        let table = Self::table_from_pointer(gdtr);

        if index == 0 || index >= table.len() {
            return Self { base_address: 0 };
        }

        let entry_value = table[index];
        let entry = DescriptorFlags::from_bits_truncate(entry_value);

        if !entry.contains(DescriptorFlags::PRESENT) {
            return Self { base_address: 0 };
        }

        let base_low = entry_value.get_bits(16..40);
        let base_high = entry_value.get_bits(56..64) << 24;
        let mut base_address = base_low | base_high;

        if !entry.contains(DescriptorFlags::USER_SEGMENT) {
            let high = table[index + 1];
            base_address += high << 32;
        }

        Self { base_address }
    }

    fn table_from_pointer(pointer: &DescriptorTablePointer<u64>) -> &[u64] {
        unsafe {
            core::slice::from_raw_parts(
                pointer.base.cast::<u64>(),
                (pointer.limit + 1) as usize / core::mem::size_of::<u64>(),
            )
        }
    }
}
