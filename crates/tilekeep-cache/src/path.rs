//! Directory layouts mapping tile coordinates to file paths

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tilekeep_grid::TileCoord;

/// On-disk layout of a file cache.
///
/// A tile's path is a pure function of its coordinate, the file extension
/// and the layout; `parse_tile_path` inverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryLayout {
    /// TileCache: `zz/xxx/xxx/xxx/yyy/yyy/yyy.ext`
    Tc,
    /// Four-digit splitting: `zz/xxxx/xxxx/yyyy/yyyy.ext`
    Mp,
    /// TMS: `z/x/y.ext`
    Tms,
    /// Reversed TMS: `y/x/z.ext`
    ReverseTms,
    /// Single directory of quadkey-named files
    Quadkey,
    /// ArcGIS exploded cache: `Lzz/Ryyyyyyyy/Cxxxxxxxx.ext`
    Arcgis,
}

impl DirectoryLayout {
    /// Relative path of the tile below the cache directory
    pub fn tile_path(&self, coord: TileCoord, ext: &str) -> PathBuf {
        let TileCoord { x, y, z } = coord;
        match self {
            DirectoryLayout::Tc => PathBuf::from(format!(
                "{:02}/{:03}/{:03}/{:03}/{:03}/{:03}/{:03}.{}",
                z,
                x / 1_000_000,
                x / 1_000 % 1_000,
                x % 1_000,
                y / 1_000_000,
                y / 1_000 % 1_000,
                y % 1_000,
                ext
            )),
            DirectoryLayout::Mp => PathBuf::from(format!(
                "{:02}/{:04}/{:04}/{:04}/{:04}.{}",
                z,
                x / 10_000,
                x % 10_000,
                y / 10_000,
                y % 10_000,
                ext
            )),
            DirectoryLayout::Tms => PathBuf::from(format!("{z}/{x}/{y}.{ext}")),
            DirectoryLayout::ReverseTms => PathBuf::from(format!("{y}/{x}/{z}.{ext}")),
            DirectoryLayout::Quadkey => PathBuf::from(format!("{}.{ext}", coord.to_quadkey())),
            DirectoryLayout::Arcgis => PathBuf::from(format!("L{z:02}/R{y:08x}/C{x:08x}.{ext}")),
        }
    }

    /// Invert [`Self::tile_path`]; returns `None` for paths that do not
    /// match the layout.
    pub fn parse_tile_path(&self, path: &Path, ext: &str) -> Option<TileCoord> {
        let parts: Vec<&str> = path.to_str()?.split('/').collect();
        let strip = |s: &str| -> Option<String> {
            s.strip_suffix(ext)?.strip_suffix('.').map(str::to_string)
        };
        match self {
            DirectoryLayout::Tc => {
                let [z, x1, x2, x3, y1, y2, y3] = parts.as_slice() else {
                    return None;
                };
                let y3 = strip(y3)?;
                let x = parse_u32(x1)? * 1_000_000 + parse_u32(x2)? * 1_000 + parse_u32(x3)?;
                let y = parse_u32(y1)? * 1_000_000 + parse_u32(y2)? * 1_000 + parse_u32(&y3)?;
                Some(TileCoord::new(x, y, parse_u32(z)? as u8))
            }
            DirectoryLayout::Mp => {
                let [z, x1, x2, y1, y2] = parts.as_slice() else {
                    return None;
                };
                let y2 = strip(y2)?;
                let x = parse_u32(x1)? * 10_000 + parse_u32(x2)?;
                let y = parse_u32(y1)? * 10_000 + parse_u32(&y2)?;
                Some(TileCoord::new(x, y, parse_u32(z)? as u8))
            }
            DirectoryLayout::Tms => {
                let [z, x, y] = parts.as_slice() else {
                    return None;
                };
                let y = strip(y)?;
                Some(TileCoord::new(
                    parse_u32(x)?,
                    parse_u32(&y)?,
                    parse_u32(z)? as u8,
                ))
            }
            DirectoryLayout::ReverseTms => {
                let [y, x, z] = parts.as_slice() else {
                    return None;
                };
                let z = strip(z)?;
                Some(TileCoord::new(
                    parse_u32(x)?,
                    parse_u32(y)?,
                    parse_u32(&z)? as u8,
                ))
            }
            DirectoryLayout::Quadkey => {
                let [name] = parts.as_slice() else {
                    return None;
                };
                TileCoord::from_quadkey(&strip(name)?)
            }
            DirectoryLayout::Arcgis => {
                let [z, y, x] = parts.as_slice() else {
                    return None;
                };
                let x = strip(x)?;
                Some(TileCoord::new(
                    u32::from_str_radix(x.strip_prefix('C')?, 16).ok()?,
                    u32::from_str_radix(y.strip_prefix('R')?, 16).ok()?,
                    parse_u32(z.strip_prefix('L')?)? as u8,
                ))
            }
        }
    }

    /// Relative path of the directory holding all tiles of `level`;
    /// `None` for layouts without per-level directories.
    pub fn level_path(&self, level: u8) -> Option<PathBuf> {
        match self {
            DirectoryLayout::Tc | DirectoryLayout::Mp => {
                Some(PathBuf::from(format!("{level:02}")))
            }
            DirectoryLayout::Tms => Some(PathBuf::from(level.to_string())),
            DirectoryLayout::Arcgis => Some(PathBuf::from(format!("L{level:02}"))),
            DirectoryLayout::ReverseTms | DirectoryLayout::Quadkey => None,
        }
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    s.parse().ok()
}

/// Sub-path for dimension values (e.g. time, elevation).
///
/// Predefined dimensions sort before custom `dim_` prefixed ones.
pub fn dimensions_part(dimensions: &BTreeMap<String, String>) -> PathBuf {
    let (custom, predefined): (Vec<_>, Vec<_>) = dimensions
        .iter()
        .partition(|(k, _)| k.starts_with("dim_"));
    let mut path = PathBuf::new();
    for (key, value) in predefined.into_iter().chain(custom) {
        path.push(format!("{key}-{value}"));
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_paths() {
        let coord = TileCoord::new(12345, 67890, 12);
        let cases = [
            (DirectoryLayout::Mp, "12/0001/2345/0006/7890.png"),
            (DirectoryLayout::Tc, "12/000/012/345/000/067/890.png"),
            (DirectoryLayout::Tms, "12/12345/67890.png"),
            (DirectoryLayout::ReverseTms, "67890/12345/12.png"),
            (DirectoryLayout::Quadkey, "200200331021.png"),
            (DirectoryLayout::Arcgis, "L12/R00010932/C00003039.png"),
        ];
        for (layout, expected) in cases {
            assert_eq!(layout.tile_path(coord, "png"), PathBuf::from(expected));
        }
    }

    #[test]
    fn test_tc_small_coords() {
        assert_eq!(
            DirectoryLayout::Tc.tile_path(TileCoord::new(3, 4, 2), "png"),
            PathBuf::from("02/000/000/003/000/000/004.png")
        );
    }

    #[test]
    fn test_roundtrip_all_layouts() {
        let layouts = [
            DirectoryLayout::Tc,
            DirectoryLayout::Mp,
            DirectoryLayout::Tms,
            DirectoryLayout::ReverseTms,
            DirectoryLayout::Quadkey,
            DirectoryLayout::Arcgis,
        ];
        // coords valid on every layout (quadkey needs x, y < 2^z)
        let coords = [
            TileCoord::new(0, 0, 1),
            TileCoord::new(3, 2, 2),
            TileCoord::new(12345, 67890, 17),
            TileCoord::new(999_999, 1_000_001, 22),
        ];
        for layout in layouts {
            for coord in coords {
                let path = layout.tile_path(coord, "png");
                assert_eq!(
                    layout.parse_tile_path(&path, "png"),
                    Some(coord),
                    "{layout:?} {coord}"
                );
            }
        }
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        assert_eq!(
            DirectoryLayout::Tms.parse_tile_path(Path::new("12/1.png"), "png"),
            None
        );
        assert_eq!(
            DirectoryLayout::Arcgis.parse_tile_path(Path::new("12/1/2.png"), "png"),
            None
        );
    }

    #[test]
    fn test_level_path() {
        assert_eq!(
            DirectoryLayout::Tc.level_path(2),
            Some(PathBuf::from("02"))
        );
        assert_eq!(
            DirectoryLayout::Arcgis.level_path(3),
            Some(PathBuf::from("L03"))
        );
        assert_eq!(DirectoryLayout::Quadkey.level_path(0), None);
    }

    #[test]
    fn test_dimensions_part() {
        let mut dims = BTreeMap::new();
        dims.insert("time".to_string(), "2020-08-25T00:00:00Z".to_string());
        dims.insert("dim_level".to_string(), "700".to_string());
        assert_eq!(
            dimensions_part(&dims),
            PathBuf::from("time-2020-08-25T00:00:00Z/dim_level-700")
        );
    }
}
