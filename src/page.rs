use byteorder::{ByteOrder, LittleEndian};
use std::mem::size_of;

pub const PAGE_SIZE: usize = 4096;

/// Page is the in-memory image of one disk block.
#[derive(Debug)]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

pub trait WriteTypeToPage {
    fn write(&self, page: &mut Page, offset: usize) -> usize;
}

pub trait ReadTypeFromPage<'a> {
    fn read(page: &'a Page, offset: usize) -> Self;
}

macro_rules! impl_endian_io_traits {
    ($t:ty, $write_fn:ident, $read_fn:ident) => {
        impl WriteTypeToPage for $t {
            fn write(&self, page: &mut Page, offset: usize) -> usize {
                let size = size_of::<Self>();
                LittleEndian::$write_fn(&mut page.data[offset..offset + size], *self);
                size
            }
        }

        impl ReadTypeFromPage<'_> for $t {
            fn read(page: &Page, offset: usize) -> Self {
                let size = size_of::<Self>();
                LittleEndian::$read_fn(&page.data[offset..offset + size])
            }
        }
    };
}

impl_endian_io_traits!(u16, write_u16, read_u16);
impl_endian_io_traits!(i16, write_i16, read_i16);
impl_endian_io_traits!(u32, write_u32, read_u32);
impl_endian_io_traits!(i32, write_i32, read_i32);
impl_endian_io_traits!(u64, write_u64, read_u64);
impl_endian_io_traits!(i64, write_i64, read_i64);

// Strings are stored as a u32 length followed by the raw bytes. A zeroed
// region therefore reads back as the empty string, which is what a pre-image
// read on a freshly formatted page should see.
impl WriteTypeToPage for &str {
    fn write(&self, page: &mut Page, offset: usize) -> usize {
        let bytes = self.as_bytes();
        let len = bytes.len();
        assert!(offset + size_of::<u32>() + len <= PAGE_SIZE);

        LittleEndian::write_u32(
            &mut page.data[offset..offset + size_of::<u32>()],
            len as u32,
        );
        if len > 0 {
            page.data[offset + size_of::<u32>()..offset + size_of::<u32>() + len]
                .copy_from_slice(bytes);
        }
        size_of::<u32>() + len
    }
}

impl ReadTypeFromPage<'_> for String {
    fn read(page: &Page, offset: usize) -> String {
        let len =
            LittleEndian::read_u32(&page.data[offset..offset + size_of::<u32>()]) as usize;
        if len == 0 {
            return String::new();
        }

        let str_bytes = &page.data[offset + size_of::<u32>()..offset + size_of::<u32>() + len];
        String::from_utf8_lossy(str_bytes).into_owned()
    }
}

impl Page {
    /// Create a new Page with all bytes zeroed.
    pub fn new() -> Self {
        Page {
            data: [0; PAGE_SIZE],
        }
    }

    /// Write a typed value at the given offset, returning the number of bytes
    /// written.
    pub fn write<T: WriteTypeToPage>(&mut self, data: T, offset: usize) -> usize {
        data.write(self, offset)
    }

    pub fn read<'a, T: ReadTypeFromPage<'a>>(&'a self, offset: usize) -> T {
        T::read(self, offset)
    }

    pub fn write_bytes(&mut self, data: &[u8], offset: usize) -> usize {
        self.data[offset..offset + data.len()].copy_from_slice(data);
        data.len()
    }

    pub fn read_bytes(&self, offset: usize, length: usize) -> &[u8] {
        &self.data[offset..offset + length]
    }

    pub fn raw(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

/// Pluggable layout strategy for freshly allocated blocks; used only when a
/// caller pins a brand-new block. Opaque to the pool.
pub trait PageFormatter {
    fn format(&self, page: &mut Page);
}

/// Formats a new page to all zeroes.
pub struct ZeroFormatter;

impl PageFormatter for ZeroFormatter {
    fn format(&self, page: &mut Page) {
        *page.raw_mut() = [0; PAGE_SIZE];
    }
}
