use crate::error::{MatchError, Result};
use crate::model::LineGeometry;
use geo::{Coord, Point};
use proj::Proj;

/// A fixed EPSG-to-EPSG coordinate transform.
///
/// `Proj` is not `Sync`; create one per thread that needs it.
pub struct Reprojector {
    proj: Proj,
    from_epsg: i32,
    to_epsg: i32,
}

impl Reprojector {
    pub fn new(from_epsg: i32, to_epsg: i32) -> Result<Self> {
        let from = format!("EPSG:{}", from_epsg);
        let to = format!("EPSG:{}", to_epsg);
        let proj = Proj::new_known_crs(&from, &to, None).map_err(|e| {
            MatchError::ProjectionSetup {
                from: from.clone(),
                to: to.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            proj,
            from_epsg,
            to_epsg,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.from_epsg == self.to_epsg
    }

    pub fn coord(&self, coord: Coord<f64>) -> Result<Coord<f64>> {
        if self.is_identity() {
            return Ok(coord);
        }
        let (x, y) = self.proj.convert((coord.x, coord.y))?;
        if !(x.is_finite() && y.is_finite()) {
            return Err(MatchError::OutsideProjection {
                x: coord.x,
                y: coord.y,
                epsg: self.to_epsg,
            });
        }
        Ok(Coord { x, y })
    }

    pub fn point(&self, point: Point<f64>) -> Result<Point<f64>> {
        self.coord(point.0).map(Point::from)
    }

    pub fn line(&self, geometry: &LineGeometry) -> Result<LineGeometry> {
        geometry.try_map_coords(|c| self.coord(c))
    }
}
