use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType};

/// Upper bound on a single frame, anything larger is treated as a corrupt stream.
const MAX_FRAME_LEN: usize = 1 << 34;

/// The receiving end handle of a rank link.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    received: usize,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx, received: 0 }
    }

    /// The amount of frames received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Waits to receive a new frame and deserializes it out of `buf`.
    ///
    /// The frame body is read into `buf` viewed as bytes, so `B`'s alignment
    /// is the alignment the deserializer sees at the start of the frame.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the maximum of {MAX_FRAME_LEN}"),
            ));
        }

        let needed = len.div_ceil(size_of::<B>());
        buf.clear();
        buf.resize(needed, bytemuck::Zeroable::zeroed());

        let view: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        self.rx.read_exact(&mut view[..len]).await?;
        self.received += 1;

        let buf: &'buf Vec<B> = buf;
        let view: &'buf [u8] = bytemuck::cast_slice(buf.as_slice());
        T::deserialize(&view[..len])
    }
}
