//! I420 plane layout inside a contiguous frame buffer.
//!
//! The layout is Y, then U, then V, with no padding between planes. Odd
//! dimensions truncate the chroma planes (`width / 2`, `height / 2`); callers
//! are expected to use even geometry.

/// Offset and stride of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Byte offset from the start of the frame buffer.
    pub offset: usize,
    /// Bytes per row.
    pub stride: usize,
    /// Number of rows.
    pub rows: usize,
}

impl Plane {
    /// Size of the plane in bytes.
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Offsets and strides of the three I420 planes for a fixed frame geometry.
///
/// Computed once at startup and reused for every frame; it holds no pointer
/// into the buffer, only positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneView {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
}

impl PlaneView {
    pub fn new(width: u32, height: u32) -> Self {
        let w = width as usize;
        let h = height as usize;
        let luma = w * h;

        let y = Plane {
            offset: 0,
            stride: w,
            rows: h,
        };
        let u = Plane {
            offset: luma,
            stride: w / 2,
            rows: h / 2,
        };
        let v = Plane {
            offset: luma + luma / 4,
            stride: w / 2,
            rows: h / 2,
        };

        Self {
            width,
            height,
            y,
            u,
            v,
        }
    }

    /// Bytes a buffer must hold for this geometry: `width * height * 3 / 2`.
    pub fn frame_len(&self) -> usize {
        self.v.offset + self.v.len()
    }

    /// Borrow the three planes out of `frame`.
    ///
    /// Returns `None` if `frame` is too short. The returned slices live no
    /// longer than the borrow of `frame`, which is the lock scope when `frame`
    /// comes from a [`FrameSource`](crate::source::FrameSource).
    pub fn planes<'a>(&self, frame: &'a [u8]) -> Option<Planes<'a>> {
        if frame.len() < self.frame_len() {
            return None;
        }
        Some(Planes {
            y: &frame[self.y.range()],
            u: &frame[self.u.range()],
            v: &frame[self.v.range()],
            view: *self,
        })
    }
}

/// Borrowed plane slices of one frame.
#[derive(Debug, Clone, Copy)]
pub struct Planes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub view: PlaneView,
}
