//! Axis-aligned bounding boxes in map units

use serde::{Deserialize, Serialize};

/// Bounding box in map coordinates (minx, miny, maxx, maxy)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BBox {
    /// Create a new bounding box
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Width in map units
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    /// Height in map units
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    /// True if the boxes share any area
    pub fn intersects(&self, other: &BBox) -> bool {
        self.minx < other.maxx
            && self.maxx > other.minx
            && self.miny < other.maxy
            && self.maxy > other.miny
    }

    /// True if `other` lies completely within this box
    pub fn contains(&self, other: &BBox) -> bool {
        self.minx <= other.minx
            && self.miny <= other.miny
            && self.maxx >= other.maxx
            && self.maxy >= other.maxy
    }

    /// Intersection of both boxes, or `None` if they do not overlap
    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BBox::new(
            self.minx.max(other.minx),
            self.miny.max(other.miny),
            self.maxx.min(other.maxx),
            self.maxy.min(other.maxy),
        ))
    }

    /// Box grown by `d` map units on every side
    pub fn buffered(&self, d: f64) -> BBox {
        BBox::new(self.minx - d, self.miny - d, self.maxx + d, self.maxy + d)
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BBox) -> BBox {
        BBox::new(
            self.minx.min(other.minx),
            self.miny.min(other.miny),
            self.maxx.max(other.maxx),
            self.maxy.max(other.maxy),
        )
    }

    /// Compare with a per-axis tolerance
    pub fn approx_eq(&self, other: &BBox, x_delta: f64, y_delta: f64) -> bool {
        (self.minx - other.minx).abs() < x_delta
            && (self.miny - other.miny).abs() < y_delta
            && (self.maxx - other.maxx).abs() < x_delta
            && (self.maxy - other.maxy).abs() < y_delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        let c = BBox::new(10.0, 10.0, 20.0, 20.0);
        assert!(a.intersects(&b));
        // touching edges do not count as intersection
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_intersection() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, -5.0, 15.0, 5.0);
        assert_eq!(a.intersection(&b), Some(BBox::new(5.0, 0.0, 10.0, 5.0)));
        assert_eq!(a.intersection(&BBox::new(20.0, 20.0, 30.0, 30.0)), None);
    }

    #[test]
    fn test_contains_and_union() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.contains(&BBox::new(1.0, 1.0, 9.0, 9.0)));
        assert!(!a.contains(&BBox::new(1.0, 1.0, 11.0, 9.0)));
        let u = a.union(&BBox::new(-5.0, 2.0, 3.0, 20.0));
        assert_eq!(u, BBox::new(-5.0, 0.0, 10.0, 20.0));
    }
}
