use nalgebra as na;

pub type Point = na::Point2<f32>;
pub type Size = na::Vector2<f32>;

/// Axis-aligned rectangle in pixel coordinates, anchored at its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_center_size(center: Point, size: Size) -> Self {
        Self {
            x: center.x - size.x / 2.,
            y: center.y - size.y / 2.,
            width: size.x,
            height: size.y,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2., self.y + self.height / 2.)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.) * self.height.max(0.)
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.);

        w * h
    }
}

/// Moves `center` so that a box of `size` lies inside a `cols` x `rows` frame.
/// A box larger than the frame along an axis is centred on that axis.
pub fn clamp_center(center: Point, size: Size, cols: usize, rows: usize) -> Point {
    fn clamp_axis(c: f32, extent: f32, limit: f32) -> f32 {
        let half = extent / 2.;
        if extent >= limit {
            limit / 2.
        } else {
            c.max(half).min(limit - half)
        }
    }

    Point::new(
        clamp_axis(center.x, size.x, cols as f32),
        clamp_axis(center.y, size.y, rows as f32),
    )
}

/// Integer pixel dimensions `(rows, cols)` of a window of the given size.
pub fn window_shape(size: &Size) -> (usize, usize) {
    (
        size.y.round().max(1.) as usize,
        size.x.round().max(1.) as usize,
    )
}
