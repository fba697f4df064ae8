//! Scalar field over the spatial grid with channels and time history.
//!
//! Storage layout is frame-major: index = i + k*nl + j*nl*nc for grid
//! point i, channel k, time slot j. A field allocated without history has
//! a single time slot and every frame accessor collapses onto it.

use crate::error::{ClaireError, Result};

/// Distributed scalar field with `nc` channels and `nslots` time frames.
#[derive(Clone, Debug)]
pub struct ScaField {
    data: Vec<f64>,
    nl: usize,
    nc: usize,
    nslots: usize,
}

impl ScaField {
    /// Allocate a zero-initialized field.
    pub fn new(nl: usize, nc: usize, nslots: usize) -> Result<Self> {
        let len = nl
            .checked_mul(nc)
            .and_then(|v| v.checked_mul(nslots))
            .ok_or_else(|| ClaireError::AllocationFailure("field size overflow".into()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| ClaireError::AllocationFailure(e.to_string()))?;
        data.resize(len, 0.0);
        Ok(Self { data, nl, nc, nslots })
    }

    /// Local grid size per channel per frame.
    #[inline]
    pub fn nl(&self) -> usize {
        self.nl
    }

    /// Number of channels.
    #[inline]
    pub fn nc(&self) -> usize {
        self.nc
    }

    /// Number of stored time frames.
    #[inline]
    pub fn nslots(&self) -> usize {
        self.nslots
    }

    /// Total element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Map a time index onto a stored slot: fields without history fold
    /// every time index onto their single frame.
    #[inline]
    fn slot(&self, j: usize) -> usize {
        if self.nslots == 1 {
            0
        } else {
            debug_assert!(j < self.nslots, "time index out of range");
            j
        }
    }

    /// Read-only view of channel `k` at time slot `j`.
    #[inline]
    pub fn frame(&self, j: usize, k: usize) -> &[f64] {
        debug_assert!(k < self.nc, "channel index out of range");
        let start = self.slot(j) * self.nl * self.nc + k * self.nl;
        &self.data[start..start + self.nl]
    }

    /// Mutable view of channel `k` at time slot `j`.
    #[inline]
    pub fn frame_mut(&mut self, j: usize, k: usize) -> &mut [f64] {
        debug_assert!(k < self.nc, "channel index out of range");
        let start = self.slot(j) * self.nl * self.nc + k * self.nl;
        &mut self.data[start..start + self.nl]
    }

    /// Disjoint mutable/immutable views of two different time slots of the
    /// same channel, as needed by an in-place time step j -> j+1.
    pub fn frame_pair_mut(&mut self, jsrc: usize, jdst: usize, k: usize) -> (&[f64], &mut [f64]) {
        let (s, d) = (self.slot(jsrc), self.slot(jdst));
        debug_assert!(s != d, "source and destination frames must differ");
        let stride = self.nl * self.nc;
        let off = k * self.nl;
        if s < d {
            let (lo, hi) = self.data.split_at_mut(d * stride);
            (
                &lo[s * stride + off..s * stride + off + self.nl],
                &mut hi[off..off + self.nl],
            )
        } else {
            let (lo, hi) = self.data.split_at_mut(s * stride);
            let dst = &mut lo[d * stride + off..d * stride + off + self.nl];
            (&hi[off..off + self.nl], dst)
        }
    }

    /// Full flat view of all frames and channels.
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Full flat mutable view.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Copy an external multi-channel frame (length nl*nc) into slot `j`.
    pub fn set_frame(&mut self, src: &[f64], j: usize) -> Result<()> {
        let expected = self.nl * self.nc;
        if src.len() != expected {
            return Err(ClaireError::DimensionMismatch {
                expected,
                actual: src.len(),
            });
        }
        let start = self.slot(j) * expected;
        self.data[start..start + expected].copy_from_slice(src);
        Ok(())
    }

    /// Copy slot `j` out into an external multi-channel buffer.
    pub fn get_frame(&self, dst: &mut [f64], j: usize) -> Result<()> {
        let expected = self.nl * self.nc;
        if dst.len() != expected {
            return Err(ClaireError::DimensionMismatch {
                expected,
                actual: dst.len(),
            });
        }
        let start = self.slot(j) * expected;
        dst.copy_from_slice(&self.data[start..start + expected]);
        Ok(())
    }

    /// Fill the whole field with a constant.
    pub fn set(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Copy another field of identical shape.
    pub fn copy_from(&mut self, other: &ScaField) -> Result<()> {
        if other.data.len() != self.data.len() {
            return Err(ClaireError::DimensionMismatch {
                expected: self.data.len(),
                actual: other.data.len(),
            });
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Min and max over all elements.
    pub fn min_max(&self) -> (f64, f64) {
        self.data.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
    }

    /// Euclidean norm over all elements.
    pub fn norm2(&self) -> f64 {
        self.data.iter().map(|&v| v * v).sum::<f64>().sqrt()
    }
}
