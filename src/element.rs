use core::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Trait for element types that can be stored in a distributed block.
///
/// Elements are plain values: they are copied in and out of exchange
/// buffers and serialized onto the wire, so no arithmetic is required.
pub trait Element:
    Copy
    + Clone
    + fmt::Debug
    + PartialEq
    + Default
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Fill value for freshly allocated blocks.
    const ZERO: Self;

    /// Short type name used in log output.
    const NAME: &'static str;

    /// Lossy conversion used by reference checks and inner products.
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($($t:ty => $zero:expr),* $(,)?) => {
        $(
            impl Element for $t {
                const ZERO: Self = $zero;
                const NAME: &'static str = stringify!($t);

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_element! {
    f32 => 0.0,
    f64 => 0.0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
}
