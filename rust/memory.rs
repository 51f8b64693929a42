//! Memory buffers bound to descriptors.
//!
//! A [`Memory`] owns a zero-initialised byte buffer large enough for the
//! padded physical layout of its [`MemoryDesc`], plus the compensation
//! storage requested by the descriptor. Elements are addressed by logical
//! index; the descriptor maps them to physical offsets.
//!
//! # Example
//!
//! ```rust
//! use memlayout::{LayoutTag, Memory, MemoryDesc, NumericKind};
//!
//! let md = MemoryDesc::new(&[2, 3], NumericKind::S8, LayoutTag::ba);
//! let mut mem = Memory::try_new(md).unwrap();
//! mem.set(&[1, 2], 300.0);
//! assert_eq!(mem.get(&[1, 2]), 127.0);
//! ```

use crate::desc::{for_each_index, MemoryDesc};
use crate::error::{Error, Result, ShapeDescriptor};

/// A descriptor together with the bytes it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    desc: MemoryDesc,
    data: Vec<u8>,
    compensation: Option<Vec<f32>>,
}

impl Memory {
    /// Allocates a zero-filled buffer for `desc`.
    ///
    /// Compensation storage is allocated when the descriptor carries a
    /// compensation whose axes are valid for its rank.
    pub fn try_new(desc: MemoryDesc) -> Result<Self> {
        let compensation = desc.compensation();
        let slots = if compensation.is_none() {
            None
        } else if compensation.is_valid_for(desc.ndims()) {
            Some(vec![0.0f32; compensation.group_count(desc.dims())])
        } else {
            return Err(Error::InvalidProblem(format!(
                "compensation {compensation} does not fit {desc}"
            )));
        };
        Ok(Self {
            data: vec![0u8; desc.size_bytes()],
            desc,
            compensation: slots,
        })
    }

    /// Allocates a buffer and fills it from `values` given in logical
    /// row-major order.
    pub fn try_from_values(desc: MemoryDesc, values: &[f32]) -> Result<Self> {
        if values.len() != desc.nelems() {
            return Err(Error::BufferMismatch {
                expected: ShapeDescriptor::new(desc.dims()).to_string(),
                got: format!("{} values", values.len()),
            });
        }
        let mut memory = Self::try_new(desc)?;
        let mut position = 0usize;
        memory.fill_with(|_| {
            let value = values[position] as f64;
            position += 1;
            value
        });
        Ok(memory)
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    /// Raw physical bytes, padding included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Stored compensation sums, if the descriptor requested any.
    pub fn compensation(&self) -> Option<&[f32]> {
        self.compensation.as_deref()
    }

    pub(crate) fn compensation_mut(&mut self) -> Option<&mut [f32]> {
        self.compensation.as_deref_mut()
    }

    /// Reads the element at logical index `idx`.
    ///
    /// `idx` must lie inside the logical dims. Indices past a blocked axis
    /// but inside its padding are not detected in release builds.
    #[inline]
    pub fn get(&self, idx: &[usize]) -> f64 {
        self.debug_check_index(idx);
        let offset = self.desc.byte_offset(idx);
        self.desc.kind().load(&self.data[offset..])
    }

    /// Converts `value` to the descriptor's kind and stores it at `idx`.
    ///
    /// Same precondition on `idx` as [`Memory::get`].
    #[inline]
    pub fn set(&mut self, idx: &[usize], value: f64) {
        self.debug_check_index(idx);
        let offset = self.desc.byte_offset(idx);
        let kind = self.desc.kind();
        kind.store(&mut self.data[offset..], value);
    }

    #[inline(always)]
    fn debug_check_index(&self, idx: &[usize]) {
        debug_assert!(
            idx.len() == self.desc.ndims()
                && idx.iter().zip(self.desc.dims()).all(|(i, d)| i < d),
            "index {idx:?} outside {}",
            self.desc
        );
    }

    /// Stores `f(idx)` at every logical index, in row-major order.
    pub fn fill_with(&mut self, mut f: impl FnMut(&[usize]) -> f64) {
        let dims = self.desc.dims().to_vec();
        for_each_index(&dims, |idx| {
            let value = f(idx);
            self.set(idx, value);
        });
    }

    /// Logical contents in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.desc.nelems());
        for_each_index(self.desc.dims(), |idx| out.push(self.get(idx)));
        out
    }

    /// Checks that this buffer was allocated for a descriptor equal to `desc`.
    pub(crate) fn expect_desc(&self, desc: &MemoryDesc) -> Result<()> {
        if &self.desc != desc || self.data.len() != desc.size_bytes() {
            return Err(Error::BufferMismatch {
                expected: desc.to_string(),
                got: self.desc.to_string(),
            });
        }
        Ok(())
    }
}
