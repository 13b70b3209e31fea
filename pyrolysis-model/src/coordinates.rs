use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RowError;
use crate::ids::TileId;

/// Highest zoom level accepted by either imagery provider.
pub const MAX_ZOOM: u8 = 22;

/// Zoom applied to lat/lon rows that omit one.
pub const DEFAULT_GOOGLE_ZOOM: u8 = 18;

/// Decimal places kept for latitude/longitude in derived tile ids.
pub const COORD_TILE_ID_PRECISION: usize = 6;

const LAT_COLUMNS: &[&str] = &["lat", "latitude"];
const LON_COLUMNS: &[&str] = &["lon", "lng", "longitude"];

/// Coordinate system of an ingestion batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaKind {
    MapboxZxy,
    GoogleLatlonZoom,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::MapboxZxy => "MAPBOX_ZXY",
            SchemaKind::GoogleLatlonZoom => "GOOGLE_LATLON_ZOOM",
        }
    }

    /// Lenient parser for command-line hints (`mapbox`, `google`, or the
    /// canonical names).
    pub fn parse_hint(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mapbox" | "mapbox_zxy" | "zxy" => Some(SchemaKind::MapboxZxy),
            "google" | "google_latlon_zoom" | "latlon" => {
                Some(SchemaKind::GoogleLatlonZoom)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized, validated coordinates of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileCoordinates {
    MapboxZxy {
        z: u8,
        x: u32,
        y: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    GoogleLatlonZoom {
        lat: f64,
        lon: f64,
        zoom: u8,
    },
}

impl TileCoordinates {
    pub fn mapbox(z: u8, x: u32, y: u32) -> Result<Self, RowError> {
        let coords = TileCoordinates::MapboxZxy {
            z,
            x,
            y,
            region: None,
        };
        coords.validate()?;
        Ok(coords)
    }

    pub fn google(lat: f64, lon: f64, zoom: u8) -> Result<Self, RowError> {
        let coords = TileCoordinates::GoogleLatlonZoom { lat, lon, zoom };
        coords.validate()?;
        Ok(coords)
    }

    pub fn schema_kind(&self) -> SchemaKind {
        match self {
            TileCoordinates::MapboxZxy { .. } => SchemaKind::MapboxZxy,
            TileCoordinates::GoogleLatlonZoom { .. } => {
                SchemaKind::GoogleLatlonZoom
            }
        }
    }

    pub fn zoom(&self) -> u8 {
        match self {
            TileCoordinates::MapboxZxy { z, .. } => *z,
            TileCoordinates::GoogleLatlonZoom { zoom, .. } => *zoom,
        }
    }

    /// Deterministic tile id: `z/x/y` for slippy tiles, and
    /// `coord:{lat},{lon},{zoom}` with six decimals for point tiles.
    pub fn tile_id(&self) -> TileId {
        match self {
            TileCoordinates::MapboxZxy { z, x, y, .. } => {
                TileId::from_raw(format!("{z}/{x}/{y}"))
            }
            TileCoordinates::GoogleLatlonZoom { lat, lon, zoom } => {
                TileId::from_raw(format!(
                    "coord:{lat:.prec$},{lon:.prec$},{zoom}",
                    prec = COORD_TILE_ID_PRECISION
                ))
            }
        }
    }

    pub fn validate(&self) -> Result<(), RowError> {
        match self {
            TileCoordinates::MapboxZxy { z, x, y, .. } => {
                check_zoom("z", *z)?;
                let limit = 1u64 << *z;
                if u64::from(*x) >= limit {
                    return Err(RowError::OutOfRange {
                        field: "x",
                        value: x.to_string(),
                        expected: format!("0..{limit}"),
                    });
                }
                if u64::from(*y) >= limit {
                    return Err(RowError::OutOfRange {
                        field: "y",
                        value: y.to_string(),
                        expected: format!("0..{limit}"),
                    });
                }
                Ok(())
            }
            TileCoordinates::GoogleLatlonZoom { lat, lon, zoom } => {
                if !lat.is_finite() || !(-90.0..=90.0).contains(lat) {
                    return Err(RowError::OutOfRange {
                        field: "lat",
                        value: lat.to_string(),
                        expected: "-90..=90".into(),
                    });
                }
                if !lon.is_finite() || !(-180.0..=180.0).contains(lon) {
                    return Err(RowError::OutOfRange {
                        field: "lon",
                        value: lon.to_string(),
                        expected: "-180..=180".into(),
                    });
                }
                check_zoom("zoom", *zoom)
            }
        }
    }
}

fn check_zoom(field: &'static str, zoom: u8) -> Result<(), RowError> {
    if zoom > MAX_ZOOM {
        return Err(RowError::OutOfRange {
            field,
            value: zoom.to_string(),
            expected: format!("0..={MAX_ZOOM}"),
        });
    }
    Ok(())
}

/// Column positions used to read a row.
///
/// Header-driven layouts resolve the positions from column names; headerless
/// input falls back to the fixed order `z,x,y[,region]` or `lat,lon[,zoom]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    Mapbox {
        z: usize,
        x: usize,
        y: usize,
        region: Option<usize>,
    },
    Google {
        lat: usize,
        lon: usize,
        zoom: Option<usize>,
    },
}

/// Outcome of inspecting the first row of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedLayout {
    pub layout: RowLayout,
    /// The first row was a header and carries no coordinates.
    pub header_consumed: bool,
}

impl RowLayout {
    pub fn positional(schema: SchemaKind) -> Self {
        match schema {
            SchemaKind::MapboxZxy => RowLayout::Mapbox {
                z: 0,
                x: 1,
                y: 2,
                region: Some(3),
            },
            SchemaKind::GoogleLatlonZoom => RowLayout::Google {
                lat: 0,
                lon: 1,
                zoom: Some(2),
            },
        }
    }

    pub fn schema(&self) -> SchemaKind {
        match self {
            RowLayout::Mapbox { .. } => SchemaKind::MapboxZxy,
            RowLayout::Google { .. } => SchemaKind::GoogleLatlonZoom,
        }
    }

    /// Inspects the first row. A recognised header wins; otherwise the hint
    /// selects a positional layout and the first row is data.
    pub fn detect(
        first_row: &[&str],
        hint: Option<SchemaKind>,
    ) -> Result<DetectedLayout, RowError> {
        let names: Vec<String> = first_row
            .iter()
            .map(|value| {
                value.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
            })
            .collect();
        let find = |aliases: &[&str]| {
            names.iter().position(|name| aliases.contains(&name.as_str()))
        };

        let detected = match (find(LAT_COLUMNS), find(LON_COLUMNS)) {
            (Some(lat), Some(lon)) => Some(RowLayout::Google {
                lat,
                lon,
                zoom: find(&["zoom", "z"]),
            }),
            _ => match (find(&["z"]), find(&["x"]), find(&["y"])) {
                (Some(z), Some(x), Some(y)) => Some(RowLayout::Mapbox {
                    z,
                    x,
                    y,
                    region: find(&["region"]),
                }),
                _ => None,
            },
        };

        match (detected, hint) {
            (Some(layout), Some(hint)) if layout.schema() != hint => {
                Err(RowError::SchemaMismatch {
                    expected: hint,
                    found: layout.schema(),
                })
            }
            (Some(layout), _) => Ok(DetectedLayout {
                layout,
                header_consumed: true,
            }),
            (None, Some(hint)) => Ok(DetectedLayout {
                layout: RowLayout::positional(hint),
                header_consumed: false,
            }),
            (None, None) => Err(RowError::UndetectedSchema),
        }
    }

    /// Normalizes one data row. Blank rows yield `Ok(None)`.
    pub fn normalize(
        &self,
        fields: &[&str],
        default_zoom: u8,
    ) -> Result<Option<TileCoordinates>, RowError> {
        if fields.iter().all(|value| value.trim().is_empty()) {
            return Ok(None);
        }
        let coords = match *self {
            RowLayout::Mapbox { z, x, y, region } => {
                TileCoordinates::MapboxZxy {
                    z: parse_field(fields, z, "z")?,
                    x: parse_field(fields, x, "x")?,
                    y: parse_field(fields, y, "y")?,
                    region: region
                        .and_then(|idx| optional_field(fields, idx))
                        .map(str::to_string),
                }
            }
            RowLayout::Google { lat, lon, zoom } => {
                let zoom = match zoom.and_then(|idx| optional_field(fields, idx))
                {
                    Some(raw) => parse_value(raw, "zoom")?,
                    None => default_zoom,
                };
                TileCoordinates::GoogleLatlonZoom {
                    lat: parse_field(fields, lat, "lat")?,
                    lon: parse_field(fields, lon, "lon")?,
                    zoom,
                }
            }
        };
        coords.validate()?;
        Ok(Some(coords))
    }
}

fn optional_field<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields
        .get(idx)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_field<T: std::str::FromStr>(
    fields: &[&str],
    idx: usize,
    field: &'static str,
) -> Result<T, RowError> {
    let raw =
        optional_field(fields, idx).ok_or(RowError::MissingField { field })?;
    parse_value(raw, field)
}

fn parse_value<T: std::str::FromStr>(
    raw: &str,
    field: &'static str,
) -> Result<T, RowError> {
    raw.parse().map_err(|_| RowError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}
