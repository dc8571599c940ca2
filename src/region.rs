//! Cuboid regions expanded into query batches.

use crate::protocol::{BlockQueryKind, Query};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A block position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Position { x, y, z }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl From<[i64; 3]> for Position {
    fn from([x, y, z]: [i64; 3]) -> Self {
        Position { x, y, z }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid position {0:?}, expected \"x,y,z\"")]
pub struct ParsePositionError(String);

impl FromStr for Position {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coords: Vec<i64> = s
            .split(',')
            .map(|part| part.trim().parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParsePositionError(s.to_string()))?;

        match coords[..] {
            [x, y, z] => Ok(Position { x, y, z }),
            _ => Err(ParsePositionError(s.to_string())),
        }
    }
}

/// Largest number of queries a region may expand to.
const MAX_QUERIES: u128 = (isize::MAX as usize / std::mem::size_of::<Query>()) as u128;

/// Reasons a pair of corners does not describe a usable region.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("corner {0} is outside the 32-bit protocol range")]
    OutOfRange(Position),
    #[error("region covers {0} positions, more than can be queried at once")]
    TooLarge(u128),
}

/// Axis-aligned box of positions, both corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    min: Position,
    max: Position,
}

impl Region {
    /// Build a region from any two opposite corners.
    ///
    /// Both corners must lie in the server's 32-bit coordinate range and the
    /// region must fit in memory as a query batch.
    pub fn new(a: Position, b: Position) -> Result<Self, RegionError> {
        for corner in [a, b] {
            let in_range = [corner.x, corner.y, corner.z]
                .into_iter()
                .all(|c| i32::try_from(c).is_ok());
            if !in_range {
                return Err(RegionError::OutOfRange(corner));
            }
        }

        let region = Region {
            min: Position::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        };
        // Block queries cover at least as many positions as height queries.
        let positions = region.positions(BlockQueryKind::BlockType);
        if positions > MAX_QUERIES {
            return Err(RegionError::TooLarge(positions));
        }
        Ok(region)
    }

    pub fn min(&self) -> Position {
        self.min
    }

    pub fn max(&self) -> Position {
        self.max
    }

    /// Number of queries of `kind` covering the region.
    ///
    /// Height queries cover each column once.
    pub fn query_count(&self, kind: BlockQueryKind) -> usize {
        usize::try_from(self.positions(kind)).unwrap_or(usize::MAX)
    }

    fn positions(&self, kind: BlockQueryKind) -> u128 {
        let span = |lo: i64, hi: i64| u128::from(hi.abs_diff(lo)) + 1;
        let columns = span(self.min.x, self.max.x) * span(self.min.z, self.max.z);
        match kind {
            BlockQueryKind::WorldHeight => columns,
            _ => columns * span(self.min.y, self.max.y),
        }
    }

    /// One query per position (per column for height queries), ordered by
    /// y, then z, then x.
    pub fn queries(&self, kind: BlockQueryKind) -> Vec<Query> {
        let mut queries = Vec::with_capacity(self.query_count(kind));
        let (y_lo, y_hi) = match kind {
            BlockQueryKind::WorldHeight => (0, 0),
            _ => (self.min.y, self.max.y),
        };

        for y in y_lo..=y_hi {
            for z in self.min.z..=self.max.z {
                for x in self.min.x..=self.max.x {
                    queries.push(Query { kind, x, y, z });
                }
            }
        }
        queries
    }
}
