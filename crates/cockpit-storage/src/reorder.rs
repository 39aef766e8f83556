//! Reordering of structured illumination stacks.
//!
//! DV readers only know five dimensions, so the angle, phase and Z loops of a
//! structured illumination run share the file's Z axis, packed in the order
//! they were collected. Reconstruction expects angle outermost, then Z, then
//! phase. The base header is kept as is; the extended header and the image
//! planes are rewritten in the new order.

use std::fs;
use std::path::{Path, PathBuf};

use cockpit_core::{CockpitError, CockpitResult};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::dv_header::{DvHeader, HEADER_BYTES, PIXEL_TYPE_U16};

/// One of the loops packed into the Z axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackAxis {
    Angle,
    Phase,
    Z,
}

impl StackAxis {
    fn slot(self) -> usize {
        match self {
            StackAxis::Angle => 0,
            StackAxis::Phase => 1,
            StackAxis::Z => 2,
        }
    }
}

/// Nesting reconstruction software reads, outermost first.
pub const RECONSTRUCTION_ORDER: [StackAxis; 3] =
    [StackAxis::Angle, StackAxis::Z, StackAxis::Phase];

/// How a stack was packed: loop nesting, outermost first, and loop lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedStack {
    pub order: [StackAxis; 3],
    pub angles: usize,
    pub phases: usize,
    pub z_slices: usize,
}

impl PackedStack {
    fn len(&self, axis: StackAxis) -> usize {
        match axis {
            StackAxis::Angle => self.angles,
            StackAxis::Phase => self.phases,
            StackAxis::Z => self.z_slices,
        }
    }

    pub fn planes(&self) -> usize {
        self.angles * self.phases * self.z_slices
    }

    /// Angle, phase and Z indices of the `packed`-th plane under `order`.
    fn unpack(&self, order: [StackAxis; 3], mut packed: usize) -> [usize; 3] {
        let mut coords = [0; 3];
        for axis in order.iter().rev() {
            let n = self.len(*axis).max(1);
            coords[axis.slot()] = packed % n;
            packed /= n;
        }
        coords
    }

    fn pack(&self, order: [StackAxis; 3], coords: [usize; 3]) -> usize {
        order
            .iter()
            .fold(0, |acc, axis| acc * self.len(*axis) + coords[axis.slot()])
    }

    /// For each plane of the reordered stack, the plane it comes from.
    pub fn source_planes(&self) -> Vec<usize> {
        (0..self.planes())
            .map(|wanted| self.pack(self.order, self.unpack(RECONSTRUCTION_ORDER, wanted)))
            .collect()
    }
}

/// Append `len` bytes of `bytes` from `start`, zero filling past the end.
fn copy_or_pad(out: &mut Vec<u8>, bytes: &[u8], start: usize, len: usize) {
    let available = bytes.len().saturating_sub(start).min(len);
    if available > 0 {
        out.extend_from_slice(&bytes[start..start + available]);
    }
    out.resize(out.len() + len - available, 0);
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".reorder");
    PathBuf::from(name)
}

/// Rewrite the DV file at `path` so its stack reads in reconstruction order.
///
/// Returns `false` when the file already is in that order. A file cut short
/// by an abort is padded with blank planes.
#[instrument(skip(stack), fields(order = ?stack.order), err)]
pub fn reorder_stack(path: &Path, stack: &PackedStack) -> CockpitResult<bool> {
    if stack.order == RECONSTRUCTION_ORDER {
        return Ok(false);
    }
    let bytes = fs::read(path)?;
    let header = DvHeader::from_bytes(&bytes)?;
    if header.pixel_type != PIXEL_TYPE_U16 {
        return Err(CockpitError::Configuration(format!(
            "cannot reorder pixel type {}",
            header.pixel_type
        )));
    }
    let dim = |v: i64| usize::try_from(v).unwrap_or(0);
    let waves = dim(header.num_waves.into()).max(1);
    let times = dim(header.num_times.into()).max(1);
    let total = dim(header.num[2].into());
    let zs = total / (waves * times);
    if zs != stack.planes() || zs * waves * times != total {
        return Err(CockpitError::Configuration(format!(
            "{} holds {zs} planes per stack, expected {}",
            path.display(),
            stack.planes()
        )));
    }

    let stride = 4 * dim(i64::from(header.num_integers) + i64::from(header.num_floats));
    let next = dim(header.next.into());
    let plane_bytes = dim(header.num[0].into()) * dim(header.num[1].into()) * 2;
    let header_bytes = HEADER_BYTES as usize;
    let data_start = header_bytes + next;
    if bytes.len() < data_start + total * plane_bytes {
        warn!(path = %path.display(), "file is truncated, padding missing planes");
    }

    let sources = stack.source_planes();
    let mut plane_order = Vec::with_capacity(total);
    for t in 0..times {
        for &z in &sources {
            plane_order.extend((0..waves).map(|w| (t * zs + z) * waves + w));
        }
    }

    let mut out = Vec::with_capacity(data_start + total * plane_bytes);
    out.extend_from_slice(&bytes[..header_bytes]);
    for &plane in &plane_order {
        copy_or_pad(&mut out, &bytes, header_bytes + plane * stride, stride);
    }
    // Anything in the extended header beyond the per-plane records.
    let tail = next.saturating_sub(total * stride);
    copy_or_pad(&mut out, &bytes, header_bytes + total * stride, tail);
    for &plane in &plane_order {
        copy_or_pad(&mut out, &bytes, data_start + plane * plane_bytes, plane_bytes);
    }

    let tmp = temp_path(path);
    fs::write(&tmp, &out)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), planes = total, "stack reordered");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_angle_phase_maps_to_angle_z_phase() {
        let stack = PackedStack {
            order: [StackAxis::Z, StackAxis::Angle, StackAxis::Phase],
            angles: 2,
            phases: 3,
            z_slices: 2,
        };
        let sources = stack.source_planes();
        // Angle 0, Z 0 then Z 1, each over three phases.
        assert_eq!(sources[..6], [0, 1, 2, 6, 7, 8]);
        assert_eq!(sources[6..9], [3, 4, 5]);
        let mut sorted = sources.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn reconstruction_order_is_the_identity() {
        let stack = PackedStack {
            order: RECONSTRUCTION_ORDER,
            angles: 3,
            phases: 5,
            z_slices: 4,
        };
        assert_eq!(stack.source_planes(), (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn padding_fills_past_the_end() {
        let mut out = Vec::new();
        copy_or_pad(&mut out, &[1, 2, 3], 1, 4);
        assert_eq!(out, vec![2, 3, 0, 0]);
        copy_or_pad(&mut out, &[1, 2, 3], 9, 2);
        assert_eq!(out, vec![2, 3, 0, 0, 0, 0]);
    }
}
