use pyrolysis_model::{COORD_TILE_ID_PRECISION, RunId, TileCoordinates};

/// Deterministic artifact key for a tile's imagery, so every attempt of the
/// same tile writes to the same object.
pub fn imagery_key(run_id: &RunId, coordinates: &TileCoordinates) -> String {
    match coordinates {
        TileCoordinates::MapboxZxy { z, x, y, .. } => {
            format!("runs/{run_id}/tiles/z={z}/x={x}/y={y}.png")
        }
        TileCoordinates::GoogleLatlonZoom { lat, lon, zoom } => format!(
            "runs/{run_id}/coords/lat={lat:.prec$}/lon={lon:.prec$}/z={zoom}.png",
            prec = COORD_TILE_ID_PRECISION
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_partitioned_by_coordinates() {
        let run = RunId::new("run_abc");
        let slippy = TileCoordinates::mapbox(5, 10, 12).expect("valid");
        assert_eq!(
            imagery_key(&run, &slippy),
            "runs/run_abc/tiles/z=5/x=10/y=12.png"
        );
        let point = TileCoordinates::google(-33.9, 151.2, 18).expect("valid");
        assert_eq!(
            imagery_key(&run, &point),
            "runs/run_abc/coords/lat=-33.900000/lon=151.200000/z=18.png"
        );
    }
}
