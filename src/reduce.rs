//! Element-wise reduction primitives and the reducer interface consumed by
//! `TenaxEngine::allreduce`.

use crate::types::{DataType, ReduceOp};

/// User-supplied associative reduction over equally-sized byte buffers.
///
/// `reduce` folds `src` into `dst` element-wise: both slices hold exactly
/// `type_nbytes * count` bytes. The operation must be associative; the engine
/// chooses the fold order along the reduction tree.
pub trait Reducer: Send + Sync {
    fn reduce(&self, src: &[u8], dst: &mut [u8], type_nbytes: usize, count: usize);
}

impl<F> Reducer for F
where
    F: Fn(&[u8], &mut [u8], usize, usize) + Send + Sync,
{
    fn reduce(&self, src: &[u8], dst: &mut [u8], type_nbytes: usize, count: usize) {
        self(src, dst, type_nbytes, count)
    }
}

/// Built-in reducer over a typed element stream.
#[derive(Debug, Clone, Copy)]
pub struct OpReducer {
    pub dtype: DataType,
    pub op: ReduceOp,
}

impl OpReducer {
    pub fn new(dtype: DataType, op: ReduceOp) -> Self {
        Self { dtype, op }
    }
}

impl Reducer for OpReducer {
    fn reduce(&self, src: &[u8], dst: &mut [u8], type_nbytes: usize, count: usize) {
        debug_assert_eq!(type_nbytes, self.dtype.size_in_bytes());
        reduce_slice(dst, src, count, self.dtype, self.op);
    }
}

trait Reducible: Copy + 'static {
    const NBYTES: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                const NBYTES: usize = std::mem::size_of::<$ty>();
                #[inline]
                fn load(bytes: &[u8]) -> Self {
                    <$ty>::from_le_bytes(bytes.try_into().unwrap())
                }
                #[inline]
                fn store(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                const NBYTES: usize = std::mem::size_of::<$ty>();
                #[inline]
                fn load(bytes: &[u8]) -> Self {
                    <$ty>::from_le_bytes(bytes.try_into().unwrap())
                }
                #[inline]
                fn store(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Element-wise reduce on byte slices interpreted as `dtype` elements.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()`
/// bytes.
pub fn reduce_slice(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType, op: ReduceOp) {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
    }
}

fn reduce_slice_typed<T: Reducible>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    assert_eq!(dst.len(), count * T::NBYTES);
    assert_eq!(src.len(), count * T::NBYTES);
    for (d, s) in dst
        .chunks_exact_mut(T::NBYTES)
        .zip(src.chunks_exact(T::NBYTES))
    {
        let merged = T::combine(T::load(d), T::load(s), op);
        merged.store(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32s(vals: &[u32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_sum_u32() {
        let mut dst = u32s(&[1, 2, 3]);
        let src = u32s(&[10, 20, 30]);
        reduce_slice(&mut dst, &src, 3, DataType::U32, ReduceOp::Sum);
        assert_eq!(dst, u32s(&[11, 22, 33]));
    }

    #[test]
    fn test_min_max_f64() {
        let vals = |v: &[f64]| -> Vec<u8> { v.iter().flat_map(|x| x.to_le_bytes()).collect() };
        let mut dst = vals(&[1.5, 9.0]);
        let src = vals(&[2.5, 3.0]);
        reduce_slice(&mut dst, &src, 2, DataType::F64, ReduceOp::Min);
        assert_eq!(dst, vals(&[1.5, 3.0]));
        let mut dst = vals(&[1.5, 9.0]);
        let src = vals(&[2.5, 3.0]);
        reduce_slice(&mut dst, &src, 2, DataType::F64, ReduceOp::Max);
        assert_eq!(dst, vals(&[2.5, 9.0]));
    }

    #[test]
    fn test_sum_wraps_ints() {
        let mut dst = u32s(&[u32::MAX]);
        let src = u32s(&[1]);
        reduce_slice(&mut dst, &src, 1, DataType::U32, ReduceOp::Sum);
        assert_eq!(dst, u32s(&[0]));
    }

    #[test]
    fn test_op_reducer_trait_object() {
        let reducer: &dyn Reducer = &OpReducer::new(DataType::U32, ReduceOp::Prod);
        let mut dst = u32s(&[2, 3]);
        let src = u32s(&[5, 7]);
        reducer.reduce(&src, &mut dst, 4, 2);
        assert_eq!(dst, u32s(&[10, 21]));
    }

    #[test]
    fn test_closure_reducer() {
        let xor = |src: &[u8], dst: &mut [u8], _nb: usize, _count: usize| {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= s;
            }
        };
        let reducer: &dyn Reducer = &xor;
        let mut dst = vec![0b1010u8];
        reducer.reduce(&[0b0110u8], &mut dst, 1, 1);
        assert_eq!(dst, vec![0b1100u8]);
    }
}
