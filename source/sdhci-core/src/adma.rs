//! ADMA2 descriptor tables.
//!
//! The ADMA2 engine walks a table of descriptors in system memory, each
//! naming one physically-contiguous chunk of the transfer. This module
//! builds those tables: [`PhysChunks`] merges pinned pages into contiguous
//! chunks, and [`build_descriptors`] lowers chunks into a caller-provided
//! descriptor slice, splitting them to respect the 65536-byte descriptor
//! length limit and an optional controller boundary alignment.
//!
//! Two descriptor layouts exist: [`AdmaDescriptor64`] (8 bytes, 32-bit
//! addresses) and [`AdmaDescriptor96`] (12 bytes, 64-bit addresses). The
//! [`AdmaDescriptor`] trait abstracts over them so the transfer path is
//! written once.

use mycelium_bitfield::bitfield;

use crate::Error;

/// The maximum number of descriptors in a table.
///
/// Sized so that a table of [`AdmaDescriptor96`]s fits within two 4 KiB
/// pages.
pub const MAX_DESCRIPTORS: usize = 512;

/// The largest chunk one descriptor can name.
pub const MAX_CHUNK_LEN: usize = 0x1_0000;

bitfield! {
    /// The attribute field shared by both descriptor layouts.
    #[derive(PartialEq, Eq)]
    pub struct DescriptorAttributes<u16> {
        pub const VALID: bool;
        pub const END: bool;
        pub const INTERRUPT: bool;
        const _RESERVED0 = 1;
        pub const ACTION = 2;
    }
}

impl DescriptorAttributes {
    /// The `Tran` action: transfer data.
    pub const ACTION_TRANSFER: u16 = 0b10;

    /// Returns the attributes of an ordinary data-transfer descriptor.
    pub fn transfer() -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::ACTION, Self::ACTION_TRANSFER)
    }
}

/// One entry in an ADMA2 descriptor table.
pub trait AdmaDescriptor: Copy {
    /// The physical address bits this layout can express.
    const ADDRESS_MASK: u64;

    /// Returns a descriptor for `len` bytes at `address`.
    ///
    /// `len` must be in `1..=`[`MAX_CHUNK_LEN`]; a length of 65536 is
    /// encoded as 0 per the ADMA2 length field definition, which truncation
    /// to `u16` does for us.
    fn new(attributes: DescriptorAttributes, len: usize, address: u64) -> Self;

    /// Marks this descriptor as the last in the table.
    fn set_end(&mut self);

    fn attributes(&self) -> DescriptorAttributes;
    fn length(&self) -> u16;
    fn address(&self) -> u64;
}

/// An 8-byte ADMA2 descriptor with a 32-bit address field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct AdmaDescriptor64 {
    attributes: u16,
    length: u16,
    address: u32,
}

impl AdmaDescriptor for AdmaDescriptor64 {
    const ADDRESS_MASK: u64 = u32::MAX as u64;

    fn new(attributes: DescriptorAttributes, len: usize, address: u64) -> Self {
        debug_assert!(len > 0 && len <= MAX_CHUNK_LEN);
        debug_assert_eq!(address & !Self::ADDRESS_MASK, 0);
        Self {
            attributes: attributes.bits(),
            length: len as u16,
            address: address as u32,
        }
    }

    fn set_end(&mut self) {
        self.attributes |= DescriptorAttributes::new().with(DescriptorAttributes::END, true).bits();
    }

    fn attributes(&self) -> DescriptorAttributes {
        DescriptorAttributes::from_bits(self.attributes)
    }

    fn length(&self) -> u16 {
        self.length
    }

    fn address(&self) -> u64 {
        self.address.into()
    }
}

/// A 12-byte ADMA2 descriptor with a 64-bit address field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C, packed)]
pub struct AdmaDescriptor96 {
    attributes: u16,
    length: u16,
    address: u64,
}

impl AdmaDescriptor for AdmaDescriptor96 {
    const ADDRESS_MASK: u64 = u64::MAX;

    fn new(attributes: DescriptorAttributes, len: usize, address: u64) -> Self {
        debug_assert!(len > 0 && len <= MAX_CHUNK_LEN);
        Self {
            attributes: attributes.bits(),
            length: len as u16,
            address,
        }
    }

    fn set_end(&mut self) {
        self.attributes |= DescriptorAttributes::new().with(DescriptorAttributes::END, true).bits();
    }

    fn attributes(&self) -> DescriptorAttributes {
        DescriptorAttributes::from_bits(self.attributes)
    }

    fn length(&self) -> u16 {
        self.length
    }

    fn address(&self) -> u64 {
        // copy out of the packed struct before use
        let address = self.address;
        address
    }
}

/// A physically-contiguous chunk of a transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Chunk {
    pub address: u64,
    pub len: usize,
}

/// Iterator merging a pinned page list into physically-contiguous [`Chunk`]s.
///
/// The transfer starts `offset` bytes into the first page and covers `total`
/// bytes.
#[derive(Debug)]
pub struct PhysChunks<'a> {
    pages: &'a [u64],
    page_size: usize,
    offset: usize,
    remaining: usize,
    idx: usize,
}

impl<'a> PhysChunks<'a> {
    pub fn new(pages: &'a [u64], page_size: usize, offset: usize, total: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(offset < page_size);
        Self {
            pages,
            page_size,
            offset,
            remaining: total,
            idx: 0,
        }
    }
}

impl Iterator for PhysChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 || self.idx >= self.pages.len() {
            return None;
        }

        let address = self.pages[self.idx] + self.offset as u64;
        let mut len = self.page_size - self.offset;
        while len < self.remaining
            && self.idx + 1 < self.pages.len()
            && self.pages[self.idx + 1] == self.pages[self.idx] + self.page_size as u64
        {
            self.idx += 1;
            len += self.page_size;
        }
        self.idx += 1;
        self.offset = 0;

        let len = len.min(self.remaining);
        self.remaining -= len;
        Some(Chunk { address, len })
    }
}

/// Lowers `chunks` into `out`, returning the number of descriptors written.
///
/// Chunks longer than [`MAX_CHUNK_LEN`] are split, as are chunks that would
/// cross a `boundary_alignment` boundary (which must be a power of two).
/// Exactly the last descriptor written has its end attribute set.
pub(crate) fn build_descriptors<D: AdmaDescriptor>(
    chunks: impl IntoIterator<Item = Chunk>,
    boundary_alignment: Option<u64>,
    out: &mut [D],
) -> Result<usize, Error> {
    if let Some(boundary) = boundary_alignment {
        debug_assert!(boundary.is_power_of_two());
    }

    let mut count = 0;
    for chunk in chunks {
        if chunk.len == 0 {
            continue;
        }

        let end = chunk.address + chunk.len as u64 - 1;
        if (chunk.address | end) & !D::ADDRESS_MASK != 0 {
            tracing::warn!(
                address = chunk.address,
                len = chunk.len,
                "chunk physical address not addressable by descriptor layout",
            );
            return Err(Error::NotSupported);
        }

        let mut address = chunk.address;
        let mut remaining = chunk.len;
        while remaining > 0 {
            if count == out.len() {
                tracing::warn!(
                    descriptors = out.len(),
                    "transfer requires too many DMA descriptors",
                );
                return Err(Error::NotSupported);
            }

            let mut len = remaining.min(MAX_CHUNK_LEN);
            if let Some(boundary) = boundary_alignment {
                let aligned_start = address & !(boundary - 1);
                let aligned_end = (address + len as u64 - 1) & !(boundary - 1);
                if aligned_start != aligned_end {
                    len = (aligned_start + boundary - address) as usize;
                }
            }

            out[count] = D::new(DescriptorAttributes::transfer(), len, address);
            address += len as u64;
            remaining -= len;
            count += 1;
        }
    }

    if count == 0 {
        return Err(Error::NotSupported);
    }

    out[count - 1].set_end();
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    const PAGE: usize = 0x1000;

    fn descs(chunks: &[Chunk], boundary: Option<u64>) -> Result<Vec<AdmaDescriptor96>, Error> {
        let mut out = [AdmaDescriptor96::new(DescriptorAttributes::new(), 1, 0); MAX_DESCRIPTORS];
        let count = build_descriptors(chunks.iter().copied(), boundary, &mut out[..])?;
        Ok(out[..count].to_vec())
    }

    fn desc_len(desc: &AdmaDescriptor96) -> usize {
        match desc.length() {
            0 => MAX_CHUNK_LEN,
            len => len.into(),
        }
    }

    #[test]
    fn attributes_layout() {
        DescriptorAttributes::assert_valid();
        assert_eq!(DescriptorAttributes::transfer().bits(), 0b10_0001);
    }

    #[test]
    fn descriptor_sizes() {
        assert_eq!(core::mem::size_of::<AdmaDescriptor64>(), 8);
        assert_eq!(core::mem::size_of::<AdmaDescriptor96>(), 12);
    }

    #[test]
    fn max_length_encodes_as_zero() {
        let desc = AdmaDescriptor96::new(DescriptorAttributes::transfer(), MAX_CHUNK_LEN, 0x2000);
        assert_eq!(desc.length(), 0);
    }

    #[test]
    fn single_chunk() {
        let descs = descs(&[Chunk { address: 0x8000, len: 512 }], None).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].address(), 0x8000);
        assert_eq!(descs[0].length(), 512);
        assert!(descs[0].attributes().get(DescriptorAttributes::VALID));
        assert!(descs[0].attributes().get(DescriptorAttributes::END));
    }

    #[test]
    fn long_chunk_is_split() {
        let total = 200_000;
        let descs = descs(&[Chunk { address: 0x10_0000, len: total }], None).unwrap();
        assert_eq!(descs.len(), 4);
        assert_eq!(descs.iter().map(desc_len).sum::<usize>(), total);
        for (i, desc) in descs.iter().enumerate() {
            let end = desc.attributes().get(DescriptorAttributes::END);
            assert_eq!(end, i == descs.len() - 1, "descriptor {i}");
        }
        // split descriptors stay physically consecutive
        for pair in descs.windows(2) {
            assert_eq!(pair[0].address() + desc_len(&pair[0]) as u64, pair[1].address());
        }
    }

    #[test]
    fn boundary_crossing_is_split() {
        let descs = descs(
            &[Chunk { address: 0x7000, len: 0x2000 }],
            Some(0x8000),
        )
        .unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].address(), 0x7000);
        assert_eq!(descs[0].length(), 0x1000);
        assert_eq!(descs[1].address(), 0x8000);
        assert_eq!(descs[1].length(), 0x1000);
    }

    #[test]
    fn too_many_descriptors() {
        let mut out = [AdmaDescriptor96::new(DescriptorAttributes::new(), 1, 0); 2];
        let res = build_descriptors(
            [Chunk { address: 0, len: 3 * MAX_CHUNK_LEN }].into_iter(),
            None,
            &mut out[..],
        );
        assert_eq!(res, Err(Error::NotSupported));
    }

    #[test]
    fn empty_transfer_is_rejected() {
        assert_eq!(descs(&[], None), Err(Error::NotSupported));
        // chunks of zero length do not produce descriptors either
        assert_eq!(
            descs(&[Chunk { address: 0x1000, len: 0 }], None),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn unaddressable_chunk_is_rejected() {
        let mut out = [AdmaDescriptor64 {
            attributes: 0,
            length: 0,
            address: 0,
        }; 4];
        let res = build_descriptors(
            [Chunk { address: 0x1_0000_0000, len: 512 }].into_iter(),
            None,
            &mut out[..],
        );
        assert_eq!(res, Err(Error::NotSupported));

        // a chunk that *ends* past 4 GiB is just as unaddressable
        let res = build_descriptors(
            [Chunk { address: 0xffff_f000, len: 0x2000 }].into_iter(),
            None,
            &mut out[..],
        );
        assert_eq!(res, Err(Error::NotSupported));
    }

    #[test]
    fn phys_chunks_merge_and_offset() {
        let pages = [0x1000, 0x2000, 0x5000];
        let chunks: Vec<Chunk> = PhysChunks::new(&pages, PAGE, 0x10, 0x2500).collect();
        assert_eq!(
            chunks,
            [
                Chunk { address: 0x1010, len: 0x1ff0 },
                Chunk { address: 0x5000, len: 0x510 },
            ]
        );
    }

    #[test]
    fn phys_chunks_single_page_short_transfer() {
        let pages = [0x9000];
        let chunks: Vec<Chunk> = PhysChunks::new(&pages, PAGE, 0, 8).collect();
        assert_eq!(chunks, [Chunk { address: 0x9000, len: 8 }]);
    }

    proptest! {
        #[test]
        fn chain_covers_transfer_exactly(
            frames in proptest::collection::vec(0u64..0x10_0000, 1..8),
            offset in 0usize..PAGE,
            len_seed in 1usize..(8 * PAGE),
            boundary_shift in proptest::option::of(12u32..=16),
        ) {
            let pages: Vec<u64> = frames.iter().map(|f| f * PAGE as u64).collect();
            let total = len_seed.min(pages.len() * PAGE - offset).max(1);
            let boundary = boundary_shift.map(|s| 1u64 << s);

            let chunks: Vec<Chunk> = PhysChunks::new(&pages, PAGE, offset, total).collect();
            prop_assert_eq!(chunks.iter().map(|c| c.len).sum::<usize>(), total);

            let mut out = [AdmaDescriptor96::new(DescriptorAttributes::new(), 1, 0); MAX_DESCRIPTORS];
            let count = build_descriptors(chunks.into_iter(), boundary, &mut out[..]).unwrap();
            let descs = &out[..count];

            prop_assert_eq!(descs.iter().map(desc_len).sum::<usize>(), total);
            for (i, desc) in descs.iter().enumerate() {
                let attrs = desc.attributes();
                prop_assert!(attrs.get(DescriptorAttributes::VALID));
                prop_assert_eq!(attrs.get(DescriptorAttributes::END), i == count - 1);
                prop_assert_eq!(attrs.get(DescriptorAttributes::ACTION), DescriptorAttributes::ACTION_TRANSFER);
                prop_assert!(desc_len(desc) <= MAX_CHUNK_LEN);
                if let Some(boundary) = boundary {
                    let first = desc.address() / boundary;
                    let last = (desc.address() + desc_len(desc) as u64 - 1) / boundary;
                    prop_assert_eq!(first, last, "descriptor {} crosses a boundary", i);
                }
            }
        }
    }
}
