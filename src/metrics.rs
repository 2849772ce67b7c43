use crate::geometry::BBox;

const EPSILON: f32 = 1e-6;

/// Intersection over union of two boxes, in `[0, 1]`.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let inter = a.intersection_area(b);
    let union = a.area() + b.area() - inter;

    if union <= EPSILON {
        return 0.;
    }

    (inter / union).max(0.).min(1.)
}

#[cfg(test)]
mod test {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn test_iou() {
        let a = BBox::new(10., 10., 10., 10.);

        assert_relative_eq!(iou(&a, &a), 1.);
        assert_relative_eq!(iou(&a, &BBox::new(30., 30., 5., 5.)), 0.);

        let b = BBox::new(15., 10., 10., 10.);
        assert_relative_eq!(iou(&a, &b), 50. / 150., epsilon = 1e-6);
        assert_relative_eq!(iou(&a, &b), iou(&b, &a));

        let inner = BBox::new(12.5, 12.5, 5., 5.);
        assert_relative_eq!(iou(&a, &inner), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_iou_degenerate() {
        let empty = BBox::new(0., 0., 0., 0.);

        assert_relative_eq!(iou(&empty, &empty), 0.);
    }

    #[test]
    fn test_iou_is_bounded() {
        let boxes = [
            BBox::new(0., 0., 4., 4.),
            BBox::new(1., 2., 8., 3.),
            BBox::new(-3., -1., 5., 9.),
            BBox::new(2., 2., 1., 1.),
        ];

        for a in boxes.iter() {
            for b in boxes.iter() {
                let v = iou(a, b);
                assert!((0. ..=1.).contains(&v));
            }
        }
    }
}
