//! Homogeneous numeric buffers with out-of-band transfer.
//!
//! A [`NumericBuffer`] serializes as a plain sequence under any serde format. While a
//! [`BufferCodec`](crate::codec::BufferCodec) frame is being written, it instead appends its
//! raw little-endian bytes to the frame's buffer list and leaves only a small placeholder in
//! the header:
//!
//! ```text
//! {"$oob": 0, "dtype": "f64", "len": 250000}
//! ```
//!
//! Decoding reverses this: the codec makes the frame's buffers available for the duration of
//! header deserialization and each placeholder takes its buffer back.

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

const OOB_KEY: &str = "$oob";

thread_local! {
    /// Buffers captured by the frame currently being encoded on this thread.
    static OUTBOUND: RefCell<Option<Vec<Vec<u8>>>> = const { RefCell::new(None) };
    /// Buffers available to the frame currently being decoded on this thread.
    static INBOUND: RefCell<Option<Vec<Option<Vec<u8>>>>> = const { RefCell::new(None) };
}

mod sealed {
    pub trait Sealed {}
}

/// Element types that can be carried in a [`NumericBuffer`].
pub trait Element:
    sealed::Sealed + Copy + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Short type tag written next to out-of-band placeholders.
    const DTYPE: &'static str;
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the little-endian encoding of `values` to `out`.
    fn extend_le(values: &[Self], out: &mut Vec<u8>);

    /// Decode little-endian bytes; `bytes.len()` must be a multiple of [`Self::SIZE`].
    fn from_le_slice(bytes: &[u8]) -> Vec<Self>;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const DTYPE: &'static str = $tag;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn extend_le(values: &[Self], out: &mut Vec<u8>) {
                    out.reserve(values.len() * Self::SIZE);
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }

                fn from_le_slice(bytes: &[u8]) -> Vec<Self> {
                    bytes
                        .chunks_exact(Self::SIZE)
                        .map(|chunk| {
                            let mut raw = [0u8; std::mem::size_of::<$ty>()];
                            raw.copy_from_slice(chunk);
                            <$ty>::from_le_bytes(raw)
                        })
                        .collect()
                }
            }
        )*
    };
}

impl_element! {
    u8 => "u8",
    i32 => "i32",
    u32 => "u32",
    i64 => "i64",
    u64 => "u64",
    f32 => "f32",
    f64 => "f64",
}

/// A contiguous buffer of numbers that the buffer codec moves without text encoding.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NumericBuffer<T: Element> {
    data: Vec<T>,
}

impl<T: Element> NumericBuffer<T> {
    /// Wrap an existing vector.
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }

    /// Borrow the values.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Unwrap into the underlying vector.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Size of the encoded payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * T::SIZE
    }
}

impl<T: Element> Deref for NumericBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: Element> From<Vec<T>> for NumericBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T: Element> FromIterator<T> for NumericBuffer<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

impl<T: Element> IntoIterator for NumericBuffer<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.into_iter()
    }
}

/// Run `f` with out-of-band capture enabled, returning its result and the captured buffers.
pub(crate) fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<Vec<u8>>) {
    let previous = OUTBOUND.with(|cell| cell.replace(Some(Vec::new())));
    let result = f();
    let captured = OUTBOUND.with(|cell| cell.replace(previous));
    (result, captured.unwrap_or_default())
}

/// Run `f` with `buffers` available to out-of-band placeholders.
pub(crate) fn provide<R>(buffers: Vec<Vec<u8>>, f: impl FnOnce() -> R) -> R {
    let slots = buffers.into_iter().map(Some).collect();
    let previous = INBOUND.with(|cell| cell.replace(Some(slots)));
    let result = f();
    INBOUND.with(|cell| cell.replace(previous));
    result
}

/// Stash `values` in the active capture, returning its index, or `None` when inactive.
fn stash<T: Element>(values: &[T]) -> Option<usize> {
    OUTBOUND.with(|cell| {
        let mut guard = cell.borrow_mut();
        let buffers = guard.as_mut()?;
        let mut bytes = Vec::new();
        T::extend_le(values, &mut bytes);
        buffers.push(bytes);
        Some(buffers.len() - 1)
    })
}

fn take(index: usize) -> Result<Vec<u8>, String> {
    INBOUND.with(|cell| {
        let mut guard = cell.borrow_mut();
        let slots = guard
            .as_mut()
            .ok_or_else(|| "out-of-band buffer outside of a buffer frame".to_string())?;
        slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| format!("out-of-band buffer {} is missing or already used", index))
    })
}

impl<T: Element> Serialize for NumericBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match stash(&self.data) {
            Some(index) => {
                let mut st = serializer.serialize_struct("NumericBuffer", 3)?;
                st.serialize_field(OOB_KEY, &index)?;
                st.serialize_field("dtype", T::DTYPE)?;
                st.serialize_field("len", &self.data.len())?;
                st.end()
            }
            None => serializer.collect_seq(&self.data),
        }
    }
}

struct BufferVisitor<T>(PhantomData<T>);

impl<'de, T: Element> Visitor<'de> for BufferVisitor<T> {
    type Value = NumericBuffer<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sequence of {} or an out-of-band placeholder", T::DTYPE)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut data = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element()? {
            data.push(v);
        }
        Ok(NumericBuffer { data })
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut index: Option<usize> = None;
        let mut dtype: Option<String> = None;
        let mut len: Option<usize> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                OOB_KEY => index = Some(map.next_value()?),
                "dtype" => dtype = Some(map.next_value()?),
                "len" => len = Some(map.next_value()?),
                _ => {
                    map.next_value::<de::IgnoredAny>()?;
                }
            }
        }
        let index = index.ok_or_else(|| de::Error::missing_field(OOB_KEY))?;
        let dtype = dtype.ok_or_else(|| de::Error::missing_field("dtype"))?;
        let len = len.ok_or_else(|| de::Error::missing_field("len"))?;

        if dtype != T::DTYPE {
            return Err(de::Error::custom(format!(
                "buffer dtype mismatch: expected {}, found {}",
                T::DTYPE,
                dtype
            )));
        }
        let bytes = take(index).map_err(de::Error::custom)?;
        if bytes.len() != len * T::SIZE {
            return Err(de::Error::custom(format!(
                "buffer {} holds {} bytes, expected {}",
                index,
                bytes.len(),
                len * T::SIZE
            )));
        }
        Ok(NumericBuffer {
            data: T::from_le_slice(&bytes),
        })
    }
}

impl<'de, T: Element> Deserialize<'de> for NumericBuffer<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BufferVisitor(PhantomData))
    }
}
