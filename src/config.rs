//! Tuning parameters for the broad-phase grid and the transfer diagnostics.

use crate::error::ConfigError;

/// Grid cell extents and diagnostic histogram resolution.
///
/// The cell extents should be on the order of the median tetrahedron edge
/// length of the meshes being coupled; there is no default that suits every
/// mesh, which is why they are configuration rather than constants. The
/// extent histogram logged at the end of each transfer is the tool for
/// picking them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Grid cell extents `(dx, dy, dz)`; positive finite reals.
    pub cell: [f64; 3],
    /// Bucket count for the tet bounding-box extent histogram.
    pub buckets: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cell: [0.1, 0.1, 0.1],
            buckets: 10,
        }
    }
}

const CELL_KEYS: [&str; 3] = ["grid.cell_x", "grid.cell_y", "grid.cell_z"];

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (axis, &value) in self.cell.iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::BadCellExtent {
                    key: CELL_KEYS[axis].to_string(),
                    value,
                });
            }
        }
        if self.buckets == 0 {
            return Err(ConfigError::BadBuckets);
        }
        Ok(())
    }

    /// Builds a configuration from `key=value` entries, starting from the
    /// defaults. Recognized keys: `grid.cell_x`, `grid.cell_y`,
    /// `grid.cell_z`, `collision.buckets`.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::BadEntry(entry.to_string()))?;
            match key {
                "grid.cell_x" => config.cell[0] = parse(key, value)?,
                "grid.cell_y" => config.cell[1] = parse(key, value)?,
                "grid.cell_z" => config.cell[2] = parse(key, value)?,
                "collision.buckets" => config.buckets = parse(key, value)?,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Number of chunks for a rank pool under the given virtualization, which
/// biases the decomposition from one chunk per rank (`0.0`) toward eight
/// (`1.0`).
pub fn overdecompose(ranks: usize, virtualization: f64) -> Result<usize, ConfigError> {
    if !(0.0..=1.0).contains(&virtualization) {
        return Err(ConfigError::BadVirtualization(virtualization));
    }
    let per_rank = 1 + (virtualization * 7.0).round() as usize;
    Ok(ranks * per_rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn entries_override_defaults() {
        let config = Config::from_entries(vec![
            "grid.cell_x=0.25",
            "grid.cell_y=0.5",
            "grid.cell_z=1.0",
            "collision.buckets=4",
        ])
        .unwrap();
        assert_eq!(config.cell, [0.25, 0.5, 1.0]);
        assert_eq!(config.buckets, 4);
    }

    #[test]
    fn bad_extents_are_rejected() {
        assert!(Config::from_entries(vec!["grid.cell_x=0.0"]).is_err());
        assert!(Config::from_entries(vec!["grid.cell_y=-1.0"]).is_err());
        assert!(Config::from_entries(vec!["grid.cell_z=nan"]).is_err());
        assert!(Config::from_entries(vec!["collision.buckets=0"]).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(
            Config::from_entries(vec!["grid.cells=1"]),
            Err(ConfigError::UnknownKey("grid.cells".to_string()))
        );
        assert_eq!(
            Config::from_entries(vec!["grid.cell_x"]),
            Err(ConfigError::BadEntry("grid.cell_x".to_string()))
        );
    }

    #[test]
    fn virtualization_scales_chunk_count() {
        assert_eq!(overdecompose(4, 0.0), Ok(4));
        assert_eq!(overdecompose(4, 1.0), Ok(32));
        assert_eq!(overdecompose(2, 0.5), Ok(10));
        assert!(overdecompose(4, -0.1).is_err());
        assert!(overdecompose(4, 1.5).is_err());
    }
}
