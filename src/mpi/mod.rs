//! MPI worlds: rank tables, queue fabric, point-to-point and collective
//! messaging, one-sided windows.

mod endpoint;
mod queue;
mod registry;
mod world;

pub use endpoint::{MpiCall, MpiMessageEndpoint, MpiServer};
pub use queue::MpiQueue;
pub use registry::MpiWorldRegistry;
pub use world::{MpiWorld, RmaWindow};

use crate::error::{Error, Result};
use crate::messages::MpiDatatype;

/// Receive-side metadata for one delivered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MpiStatus {
    /// Rank that sent the message.
    pub source: i32,
    /// Actual payload size in bytes, which may be less than requested.
    pub bytes_size: usize,
}

/// Elementwise reduction operators. All supported operators are
/// associative and commutative, so receive order never matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiOp {
    Sum,
    Max,
    Min,
}

macro_rules! fold_elements {
    ($ty:ty, $op:expr, $count:expr, $input:expr, $acc:expr) => {{
        let width = std::mem::size_of::<$ty>();
        for i in 0..$count {
            let span = i * width..(i + 1) * width;
            let a = <$ty>::from_ne_bytes(
                $acc[span.clone()].try_into().expect("length checked"),
            );
            let b = <$ty>::from_ne_bytes(
                $input[span.clone()].try_into().expect("length checked"),
            );
            let folded = match $op {
                MpiOp::Sum => a + b,
                MpiOp::Max => {
                    if b > a {
                        b
                    } else {
                        a
                    }
                }
                MpiOp::Min => {
                    if b < a {
                        b
                    } else {
                        a
                    }
                }
            };
            $acc[span].copy_from_slice(&folded.to_ne_bytes());
        }
    }};
}

/// Fold `input` into `acc` elementwise: `acc[i] = op(acc[i], input[i])`.
///
/// Fails with `UnsupportedOp` for non-reducible datatypes and leaves the
/// accumulator untouched on any error.
pub fn op_reduce(
    op: MpiOp,
    datatype: MpiDatatype,
    count: usize,
    input: &[u8],
    acc: &mut [u8],
) -> Result<()> {
    let needed = count * datatype.size();
    if input.len() < needed || acc.len() < needed {
        return Err(Error::InvalidArgument(format!(
            "reduce buffers too small: need {needed}, have {}/{}",
            input.len(),
            acc.len()
        )));
    }

    match datatype {
        MpiDatatype::Int => fold_elements!(i32, op, count, input, acc),
        MpiDatatype::Double => fold_elements!(f64, op, count, input, acc),
        MpiDatatype::LongLong => fold_elements!(i64, op, count, input, acc),
        MpiDatatype::Byte => {
            return Err(Error::UnsupportedOp(format!("{datatype:?}")));
        }
    }
    Ok(())
}

/// Typed-buffer helpers. All hosts agree on element layout, so native-endian
/// byte order is the wire format.
pub fn i32_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().expect("chunks of four")))
        .collect()
}

pub fn f64_to_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_ne_bytes(c.try_into().expect("chunks of eight")))
        .collect()
}

pub fn i64_to_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn bytes_to_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().expect("chunks of eight")))
        .collect()
}
