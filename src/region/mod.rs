//! Geographic coverage of content packages
//!
//! Regions are polygon boundaries in the Osmosis `.poly` text format:
//!
//! ```text
//! karelia            <- region name
//! 1                  <- ring id (a leading '!' marks a hole)
//!    30.0   60.0     <- lon lat
//!    38.0   60.0
//!    38.0   66.0
//! END                <- end of ring
//! END                <- end of file
//! ```

pub mod cache;

pub use cache::RegionCache;

use std::io::{self, BufRead, BufReader, Read};

/// A WGS84 location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Ring {
    /// (lon, lat) vertices, implicitly closed
    points: Vec<(f64, f64)>,
    hole: bool,
}

impl Ring {
    /// Even-odd ray casting test
    fn contains(&self, lon: f64, lat: f64) -> bool {
        let mut inside = false;
        let n = self.points.len();
        if n < 3 {
            return false;
        }

        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }

        inside
    }
}

/// A polygon boundary with a point-in-polygon test
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    name: String,
    rings: Vec<Ring>,
}

impl Region {
    /// Parse a region from `.poly` text
    pub fn parse<R: Read>(reader: R) -> io::Result<Self> {
        let mut lines = BufReader::new(reader)
            .lines()
            .map(|line| line.map(|l| l.trim().to_string()))
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()));

        let name = lines
            .next()
            .ok_or_else(|| invalid("empty polygon file"))??;

        let mut rings = Vec::new();
        loop {
            let header = lines
                .next()
                .ok_or_else(|| invalid("polygon file is not terminated"))??;
            if header == "END" {
                break;
            }

            let hole = header.starts_with('!');
            let mut points = Vec::new();
            loop {
                let line = lines
                    .next()
                    .ok_or_else(|| invalid("polygon ring is not terminated"))??;
                if line == "END" {
                    break;
                }
                points.push(parse_vertex(&line)?);
            }

            rings.push(Ring { points, hole });
        }

        if !rings.iter().any(|r| !r.hole) {
            return Err(invalid("polygon has no outer ring"));
        }

        Ok(Self { name, rings })
    }

    pub fn parse_str(text: &str) -> io::Result<Self> {
        Self::parse(text.as_bytes())
    }

    /// Axis-aligned rectangle, used for formats that only carry a bounding box
    pub fn from_bounds(name: &str, min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            name: name.to_string(),
            rings: vec![Ring {
                points: vec![
                    (min_lon, min_lat),
                    (max_lon, min_lat),
                    (max_lon, max_lat),
                    (min_lon, max_lat),
                ],
                hole: false,
            }],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inside any outer ring and outside every hole
    pub fn test_hit(&self, point: GeoPoint) -> bool {
        let in_outer = self
            .rings
            .iter()
            .filter(|r| !r.hole)
            .any(|r| r.contains(point.lon, point.lat));

        in_outer
            && !self
                .rings
                .iter()
                .filter(|r| r.hole)
                .any(|r| r.contains(point.lon, point.lat))
    }
}

fn parse_vertex(line: &str) -> io::Result<(f64, f64)> {
    let mut parts = line.split_whitespace();
    let lon = parts.next().and_then(|s| s.parse::<f64>().ok());
    let lat = parts.next().and_then(|s| s.parse::<f64>().ok());
    match (lon, lat) {
        (Some(lon), Some(lat)) => Ok((lon, lat)),
        _ => Err(invalid(&format!("bad polygon vertex: {line}"))),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
