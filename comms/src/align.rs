/// Primitive number types whose alignment is at least 4 bytes.
///
/// Receive buffers are built out of these so that numeric payloads placed right after the
/// 4 byte message header can be reinterpreted as `f32` slices without copying.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for u128 {}
impl Align4 for i128 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
