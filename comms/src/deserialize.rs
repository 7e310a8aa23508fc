use std::io;

/// Types that can be read back from the wire format, possibly borrowing from the buffer.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
