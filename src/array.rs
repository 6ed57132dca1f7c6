//! Conversion between raw measure bytes and typed element arrays.

use bytes::Bytes;
use zerocopy::{AsBytes, FromBytes};

use crate::error::CubeError;

/// Convert from Bytes to a slice of a numerical type without copying.
///
/// Fails if the data is not a whole number of elements or is not aligned for `T`.
fn from_bytes<T: FromBytes>(data: &[u8]) -> Result<&[T], CubeError> {
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(data).ok_or(
        CubeError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice())
}

/// Decode raw little-endian element bytes into a vector of `T`.
///
/// Measure bytes read from storage have no alignment guarantee, so misaligned input is first
/// copied into an 8-byte aligned buffer.
pub fn decode<T: FromBytes + Copy>(data: &[u8]) -> Result<Vec<T>, CubeError> {
    if data.len() % std::mem::size_of::<T>() != 0 {
        return Err(CubeError::FromBytes {
            type_name: std::any::type_name::<T>(),
        });
    }
    if let Ok(values) = from_bytes::<T>(data) {
        return Ok(values.to_vec());
    }
    // The capacity is exact, so extending does not reallocate and the alignment holds.
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len());
    buf.extend_from_slice(data);
    Ok(from_bytes::<T>(&buf)?.to_vec())
}

/// Encode elements as raw bytes.
pub fn encode<T: AsBytes>(values: &[T]) -> Bytes {
    Bytes::copy_from_slice(values.as_bytes())
}
