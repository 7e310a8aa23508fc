/// Types that can be written into the wire format.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer where the owned part of the message gets written.
    ///
    /// # Returns
    /// An optional borrowed tail that will be written right after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
