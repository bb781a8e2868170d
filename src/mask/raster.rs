use ndarray::{Array2, Axis, Zip};

/// Boolean raster marking a segmented region
///
/// Stored row-major as `[height, width]`, the same orientation the decoder
/// emits its logits in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    data: Array2<bool>,
}

impl Mask {
    /// All-false mask of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: Array2::from_elem((height as usize, width as usize), false),
        }
    }

    pub fn from_array(data: Array2<bool>) -> Self {
        Self { data }
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> bool,
    {
        Self {
            data: Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
                f(x as u32, y as u32)
            }),
        }
    }

    /// Axis-aligned filled rectangle, corners inclusive
    pub fn rect(width: u32, height: u32, x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self::from_fn(width, height, |x, y| x >= x1 && x <= x2 && y >= y1 && y <= y2)
    }

    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    /// (width, height), matching `image::ImageBuffer::dimensions`
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[[y as usize, x as usize]]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        self.data[[y as usize, x as usize]] = value;
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.data
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_blank(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }

    /// OR `other` into this mask
    pub fn union_with(&mut self, other: &Mask) {
        Zip::from(&mut self.data)
            .and(&other.data)
            .for_each(|a, &b| *a |= b);
    }

    /// Clear every position set in `other`
    pub fn subtract(&mut self, other: &Mask) {
        Zip::from(&mut self.data)
            .and(&other.data)
            .for_each(|a, &b| *a &= !b);
    }

    /// Intersection over union; two blank masks score 0
    pub fn iou(&self, other: &Mask) -> f32 {
        let mut inter = 0usize;
        let mut union = 0usize;
        Zip::from(&self.data).and(&other.data).for_each(|&a, &b| {
            if a && b {
                inter += 1;
            }
            if a || b {
                union += 1;
            }
        });
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }

    /// Tight bounds as (x1, y1, x2, y2), inclusive
    pub fn bounding_box(&self) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for ((y, x), &v) in self.data.indexed_iter() {
            if !v {
                continue;
            }
            let (x, y) = (x as u32, y as u32);
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
            });
        }
        bounds
    }

    /// Morphological dilation with a `kernel`×`kernel` square element
    ///
    /// The anchor sits at `kernel / 2` like OpenCV's default, so even kernels
    /// grow one pixel further towards the bottom-right. Kernels of 0 or 1 leave
    /// the mask unchanged.
    pub fn dilate(&self, kernel: u32, iterations: u32) -> Mask {
        if kernel <= 1 || iterations == 0 {
            return self.clone();
        }

        let lo = -((kernel / 2) as isize);
        let hi = kernel as isize - 1 + lo;

        let mut current = self.data.clone();
        for _ in 0..iterations {
            // The square element is separable: a row pass then a column pass
            current = dilate_axis(&current, Axis(1), lo, hi);
            current = dilate_axis(&current, Axis(0), lo, hi);
        }

        Mask { data: current }
    }
}

fn dilate_axis(src: &Array2<bool>, axis: Axis, lo: isize, hi: isize) -> Array2<bool> {
    let (rows, cols) = src.dim();
    let len = src.len_of(axis) as isize;

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let pos = (if axis == Axis(1) { c } else { r }) as isize;
        let start = (pos + lo).max(0);
        let end = (pos + hi).min(len - 1);
        (start..=end).any(|i| {
            let i = i as usize;
            if axis == Axis(1) {
                src[[r, i]]
            } else {
                src[[i, c]]
            }
        })
    })
}
