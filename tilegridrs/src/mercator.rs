//! Web-mercator arithmetic needed by the SQL builders.
//!
//! A small injected value type rather than a module-level singleton: the
//! aggregation builder keeps a copy and asks it for pixel resolutions and
//! tile extents.

/// Half the web-mercator extent of the earth, in meters (EPSG:3857).
pub const HALF_EARTH_EXTENT: f64 = 20037508.342789244;

const TILE_SIZE: f64 = 256.0;

/// Bounding box in web-mercator coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercatorHelper;

impl WebMercatorHelper {
    pub fn new() -> Self {
        Self
    }

    /// Pixel size in meters at zoom level `z` (256px tiles).
    pub fn resolution(&self, z: u32) -> f64 {
        (HALF_EARTH_EXTENT * 2.0) / TILE_SIZE / (1u64 << z) as f64
    }

    /// Web-mercator extent of tile `(x, y)` at zoom `z` (XYZ scheme,
    /// origin at the top-left corner).
    pub fn extent(&self, x: u32, y: u32, z: u32) -> Extent {
        let tile_span = (HALF_EARTH_EXTENT * 2.0) / (1u64 << z) as f64;
        let xmin = -HALF_EARTH_EXTENT + f64::from(x) * tile_span;
        let ymax = HALF_EARTH_EXTENT - f64::from(y) * tile_span;
        Extent {
            xmin,
            ymin: ymax - tile_span,
            xmax: xmin + tile_span,
            ymax,
        }
    }
}
