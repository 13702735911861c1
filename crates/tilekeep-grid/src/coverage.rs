//! Coverage polygons restricting the area of a cache

use geo::{BoundingRect, Contains, Intersects};
use geo_types::{Coord, MultiPolygon, Polygon, Rect};

use crate::bbox::BBox;
use crate::coord::Srs;
use crate::error::{GridError, Result};

fn bbox_to_polygon(bbox: &BBox) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: bbox.minx,
            y: bbox.miny,
        },
        Coord {
            x: bbox.maxx,
            y: bbox.maxy,
        },
    )
    .to_polygon()
}

/// A polygon limiting which tiles belong to a cache.
///
/// Tiles whose bbox does not intersect the coverage are treated as outside
/// the cached area. With `clip` enabled, partially covered tiles are masked
/// so pixels outside the polygon become transparent.
#[derive(Debug, Clone)]
pub struct Coverage {
    geom: MultiPolygon<f64>,
    srs: Srs,
    clip: bool,
    bbox: BBox,
}

impl Coverage {
    /// Coverage from a polygon in `srs`
    pub fn new(geom: MultiPolygon<f64>, srs: Srs) -> Self {
        let bbox = geom
            .bounding_rect()
            .map(|r| BBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
            .unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0));
        Self {
            geom,
            srs,
            clip: false,
            bbox,
        }
    }

    /// Rectangular coverage
    pub fn from_bbox(bbox: BBox, srs: Srs) -> Self {
        Self::new(MultiPolygon(vec![bbox_to_polygon(&bbox)]), srs)
    }

    /// Enable or disable clipping of partially covered tiles
    pub fn with_clip(mut self, clip: bool) -> Self {
        self.clip = clip;
        self
    }

    /// True if partially covered tiles should be masked
    pub fn clip(&self) -> bool {
        self.clip
    }

    /// Spatial reference of the coverage geometry
    pub fn srs(&self) -> Srs {
        self.srs
    }

    /// The coverage geometry
    pub fn geom(&self) -> &MultiPolygon<f64> {
        &self.geom
    }

    /// Bounding box of the coverage geometry
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    fn check_srs(&self, srs: Srs) -> Result<()> {
        if srs != self.srs {
            return Err(GridError::SrsMismatch {
                expected: self.srs,
                actual: srs,
            });
        }
        Ok(())
    }

    /// True if `bbox` shares any area with the coverage
    pub fn intersects(&self, bbox: &BBox, srs: Srs) -> Result<bool> {
        self.check_srs(srs)?;
        if !self.bbox.intersects(bbox) {
            return Ok(false);
        }
        Ok(self.geom.intersects(&bbox_to_polygon(bbox)))
    }

    /// True if `bbox` lies completely inside the coverage
    pub fn contains(&self, bbox: &BBox, srs: Srs) -> Result<bool> {
        self.check_srs(srs)?;
        if !self.bbox.contains(bbox) {
            return Ok(false);
        }
        Ok(self.geom.contains(&bbox_to_polygon(bbox)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage() -> Coverage {
        Coverage::from_bbox(BBox::new(0.0, 0.0, 100.0, 100.0), Srs::WEB_MERCATOR)
    }

    #[test]
    fn test_intersects() {
        let cov = coverage();
        let srs = Srs::WEB_MERCATOR;
        assert!(cov.intersects(&BBox::new(50.0, 50.0, 150.0, 150.0), srs).unwrap());
        assert!(!cov.intersects(&BBox::new(200.0, 200.0, 300.0, 300.0), srs).unwrap());
    }

    #[test]
    fn test_contains() {
        let cov = coverage();
        let srs = Srs::WEB_MERCATOR;
        assert!(cov.contains(&BBox::new(10.0, 10.0, 90.0, 90.0), srs).unwrap());
        assert!(!cov.contains(&BBox::new(10.0, 10.0, 110.0, 90.0), srs).unwrap());
    }

    #[test]
    fn test_srs_mismatch() {
        let cov = coverage();
        assert!(matches!(
            cov.intersects(&BBox::new(0.0, 0.0, 1.0, 1.0), Srs::WGS84),
            Err(GridError::SrsMismatch { .. })
        ));
    }
}
