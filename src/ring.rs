// SPDX-License-Identifier: MPL-2.0

//! Fixed-capacity ring of CPU-visible NV12 frames.
//!
//! ```text
//!            claim()            claim()
//! decode ──► slot 0 ──► draw    slot 1 ──► draw    slot 0 ...
//! ```
//!
//! Storage is allocated once at the stream's resolution. Every slot holds a
//! luma plane followed by an interleaved chroma plane, both with rows padded
//! to [`ROW_ALIGN`]. A slot stays valid for reading until it is claimed
//! again [`RING_SLOTS`] claims later, so at most one frame is in flight
//! while the next is being written.

/// Number of preallocated slots.
pub const RING_SLOTS: usize = 2;

/// Row alignment of both planes, in bytes.
pub const ROW_ALIGN: usize = 64;

/// Index of a slot inside a [`FrameRing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex(usize);

impl SlotIndex {
    #[cfg(test)]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Source plane handed to the ring: pixel rows and the distance between them.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<Box<[u8]>>,
    width: usize,
    height: usize,
    y_stride: usize,
    uv_stride: usize,
    next: usize,
}

impl FrameRing {
    pub fn new(width: u32, height: u32) -> Self {
        let width = width as usize;
        let height = height as usize;
        let y_stride = align(width.max(1));
        let uv_stride = y_stride;
        let slot_len = y_stride * height + uv_stride * height.div_ceil(2);

        Self {
            slots: (0..RING_SLOTS)
                .map(|_| vec![0u8; slot_len].into_boxed_slice())
                .collect(),
            width,
            height,
            y_stride,
            uv_stride,
            next: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width as u32
    }

    pub fn height(&self) -> u32 {
        self.height as u32
    }

    pub fn y_stride(&self) -> usize {
        self.y_stride
    }

    pub fn uv_stride(&self) -> usize {
        self.uv_stride
    }

    fn chroma_rows(&self) -> usize {
        self.height.div_ceil(2)
    }

    fn chroma_row_bytes(&self) -> usize {
        self.width.div_ceil(2) * 2
    }

    fn luma_len(&self) -> usize {
        self.y_stride * self.height
    }

    /// Luma plane of a slot.
    pub fn luma(&self, slot: SlotIndex) -> &[u8] {
        &self.slots[slot.0][..self.luma_len()]
    }

    /// Interleaved CbCr plane of a slot.
    pub fn chroma(&self, slot: SlotIndex) -> &[u8] {
        &self.slots[slot.0][self.luma_len()..]
    }

    fn claim(&mut self) -> SlotIndex {
        let slot = SlotIndex(self.next);
        self.next = (self.next + 1) % RING_SLOTS;
        slot
    }

    /// Copy a semi-planar frame (luma + interleaved chroma) into the next slot.
    pub fn write_nv12(&mut self, y: Plane<'_>, uv: Plane<'_>) -> SlotIndex {
        let slot = self.claim();
        let (luma_len, y_stride, uv_stride) = (self.luma_len(), self.y_stride, self.uv_stride);
        let (width, height) = (self.width, self.height);
        let (chroma_rows, chroma_bytes) = (self.chroma_rows(), self.chroma_row_bytes());

        let (dst_y, dst_uv) = self.slots[slot.0].split_at_mut(luma_len);
        copy_rows(dst_y, y_stride, y, width, height);
        copy_rows(dst_uv, uv_stride, uv, chroma_bytes, chroma_rows);

        slot
    }

    /// Copy a fully planar frame into the next slot, interleaving U and V.
    pub fn write_i420(&mut self, y: Plane<'_>, u: Plane<'_>, v: Plane<'_>) -> SlotIndex {
        let slot = self.claim();
        let (luma_len, y_stride, uv_stride) = (self.luma_len(), self.y_stride, self.uv_stride);
        let (width, height) = (self.width, self.height);
        let (chroma_rows, chroma_width) = (self.chroma_rows(), self.width.div_ceil(2));

        let (dst_y, dst_uv) = self.slots[slot.0].split_at_mut(luma_len);
        copy_rows(dst_y, y_stride, y, width, height);

        for row in 0..chroma_rows {
            let (Some(u_row), Some(v_row)) = (
                row_of(u, row, chroma_width),
                row_of(v, row, chroma_width),
            ) else {
                break;
            };
            let dst_row = &mut dst_uv[row * uv_stride..row * uv_stride + chroma_width * 2];
            for (pair, (cb, cr)) in dst_row.chunks_exact_mut(2).zip(u_row.iter().zip(v_row)) {
                pair[0] = *cb;
                pair[1] = *cr;
            }
        }

        slot
    }
}

fn align(value: usize) -> usize {
    (value + ROW_ALIGN - 1) & !(ROW_ALIGN - 1)
}

fn row_of<'a>(plane: Plane<'a>, row: usize, len: usize) -> Option<&'a [u8]> {
    let start = row * plane.stride;
    plane.data.get(start..start + len)
}

/// Row-by-row copy that tolerates a source stride different from ours.
/// Rows missing from a short source are left untouched.
fn copy_rows(dst: &mut [u8], dst_stride: usize, src: Plane<'_>, row_bytes: usize, rows: usize) {
    let row_bytes = row_bytes.min(dst_stride);

    if src.stride == dst_stride {
        let len = (dst_stride * rows).min(src.data.len()).min(dst.len());
        dst[..len].copy_from_slice(&src.data[..len]);
        return;
    }

    for row in 0..rows {
        let Some(src_row) = row_of(src, row, row_bytes) else {
            break;
        };
        let start = row * dst_stride;
        dst[start..start + row_bytes].copy_from_slice(src_row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_are_aligned() {
        let ring = FrameRing::new(1920, 1080);
        assert_eq!(ring.y_stride(), 1920);
        assert_eq!(ring.uv_stride(), 1920);

        let ring = FrameRing::new(1000, 500);
        assert_eq!(ring.y_stride(), 1024);
        assert_eq!(ring.luma(SlotIndex(0)).len(), 1024 * 500);
        assert_eq!(ring.chroma(SlotIndex(0)).len(), 1024 * 250);
    }

    #[test]
    fn test_odd_height_keeps_last_chroma_row() {
        let ring = FrameRing::new(33, 17);
        assert_eq!(ring.y_stride(), 64);
        assert_eq!(ring.chroma(SlotIndex(1)).len(), 64 * 9);
    }

    #[test]
    fn test_slots_claimed_round_robin() {
        let mut ring = FrameRing::new(4, 2);
        let y = [0u8; 8];
        let uv = [0u8; 4];

        let first = ring.write_nv12(Plane { data: &y, stride: 4 }, Plane { data: &uv, stride: 4 });
        let second = ring.write_nv12(Plane { data: &y, stride: 4 }, Plane { data: &uv, stride: 4 });
        let third = ring.write_nv12(Plane { data: &y, stride: 4 }, Plane { data: &uv, stride: 4 });

        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);
        assert_eq!(third, first);
    }

    #[test]
    fn test_nv12_copy_respects_source_stride() {
        let mut ring = FrameRing::new(4, 2);
        // source rows padded to 6 bytes
        let y = [1, 2, 3, 4, 0xee, 0xee, 5, 6, 7, 8, 0xee, 0xee];
        let uv = [10, 20, 30, 40, 0xee, 0xee];

        let slot = ring.write_nv12(Plane { data: &y, stride: 6 }, Plane { data: &uv, stride: 6 });

        let luma = ring.luma(slot);
        assert_eq!(&luma[..4], &[1, 2, 3, 4]);
        assert_eq!(&luma[64..68], &[5, 6, 7, 8]);
        assert_eq!(&ring.chroma(slot)[..4], &[10, 20, 30, 40]);
        assert!(!luma.contains(&0xee));
    }

    #[test]
    fn test_i420_chroma_is_interleaved() {
        let mut ring = FrameRing::new(4, 4);
        let y = [7u8; 16];
        let u = [1, 2, 3, 4];
        let v = [5, 6, 7, 8];

        let slot = ring.write_i420(
            Plane { data: &y, stride: 4 },
            Plane { data: &u, stride: 2 },
            Plane { data: &v, stride: 2 },
        );

        let chroma = ring.chroma(slot);
        assert_eq!(&chroma[..4], &[1, 5, 2, 6]);
        assert_eq!(&chroma[64..68], &[3, 7, 4, 8]);
        assert_eq!(&ring.luma(slot)[..4], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_short_source_does_not_panic() {
        let mut ring = FrameRing::new(8, 8);
        let y = [9u8; 12];
        let uv = [3u8; 2];

        let slot = ring.write_nv12(Plane { data: &y, stride: 8 }, Plane { data: &uv, stride: 8 });
        assert_eq!(&ring.luma(slot)[..8], &[9; 8]);
        assert_eq!(ring.luma(slot)[64], 0);
    }
}
