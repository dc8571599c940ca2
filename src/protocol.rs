//! Block query codec for the Minecraft Pi text protocol.
//!
//! Requests are single lines terminated by `\n`:
//! - `world.getBlock(x,y,z)` -> `id`
//! - `world.getBlockWithData(x,y,z)` -> `id,data`
//! - `world.getHeight(x,z)` -> `y`
//!
//! The server answers every request with exactly one line, in request order.
//! Failed requests are answered with the token `Fail`.
//!
//! The codec is stateless: it never knows which query a response belongs to.
//! Pairing is positional and done by the pipeline.

use crate::error::QueryError;
use bytes::BytesMut;
use std::fmt;

/// Error token the server sends instead of a value.
pub const SERVER_ERROR_TOKEN: &str = "Fail";

/// What a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockQueryKind {
    /// Block type id at a position.
    BlockType,
    /// Block type id and data value at a position.
    BlockTypeWithData,
    /// Height of the highest solid block in a column. `y` is ignored.
    WorldHeight,
}

impl BlockQueryKind {
    /// Protocol command name.
    pub fn command(&self) -> &'static str {
        match self {
            BlockQueryKind::BlockType => "world.getBlock",
            BlockQueryKind::BlockTypeWithData => "world.getBlockWithData",
            BlockQueryKind::WorldHeight => "world.getHeight",
        }
    }
}

/// A single point query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Query {
    pub kind: BlockQueryKind,
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Query {
    pub fn block(x: i64, y: i64, z: i64) -> Self {
        Query {
            kind: BlockQueryKind::BlockType,
            x,
            y,
            z,
        }
    }

    pub fn block_with_data(x: i64, y: i64, z: i64) -> Self {
        Query {
            kind: BlockQueryKind::BlockTypeWithData,
            x,
            y,
            z,
        }
    }

    /// Column height query. `y` is fixed to zero.
    pub fn height(x: i64, z: i64) -> Self {
        Query {
            kind: BlockQueryKind::WorldHeight,
            x,
            y: 0,
            z,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BlockQueryKind::WorldHeight => write!(f, "{}({},{})", self.kind.command(), self.x, self.z),
            _ => write!(
                f,
                "{}({},{},{})",
                self.kind.command(),
                self.x,
                self.y,
                self.z
            ),
        }
    }
}

/// Decoded response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockValue {
    Block(i32),
    BlockWithData { id: i32, data: i32 },
    Height(i32),
}

impl BlockValue {
    /// Primary integer of the response: block id or column height.
    pub fn value(&self) -> i32 {
        match *self {
            BlockValue::Block(id) => id,
            BlockValue::BlockWithData { id, .. } => id,
            BlockValue::Height(y) => y,
        }
    }
}

impl fmt::Display for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockValue::Block(id) => write!(f, "{id}"),
            BlockValue::BlockWithData { id, data } => write!(f, "{id},{data}"),
            BlockValue::Height(y) => write!(f, "{y}"),
        }
    }
}

/// Encode a query into its request line, without the line terminator.
pub fn encode(query: &Query) -> Result<String, QueryError> {
    check_coordinate("x", query.x)?;
    check_coordinate("z", query.z)?;
    if query.kind != BlockQueryKind::WorldHeight {
        check_coordinate("y", query.y)?;
    }
    Ok(query.to_string())
}

/// Encode a query and append it, terminated, to a request buffer.
///
/// Nothing is appended when encoding fails.
pub fn encode_into(query: &Query, buf: &mut BytesMut) -> Result<(), QueryError> {
    let line = encode(query)?;
    buf.reserve(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(b"\n");
    Ok(())
}

/// Decode a raw response line as read from the stream.
///
/// Bytes that are not valid UTF-8 are a decoding failure of this line.
pub fn decode_line(kind: BlockQueryKind, line: &[u8]) -> Result<BlockValue, QueryError> {
    match std::str::from_utf8(line) {
        Ok(line) => decode(kind, line),
        Err(_) => Err(decoding_error(
            &String::from_utf8_lossy(line),
            "response is not valid UTF-8",
        )),
    }
}

/// Decode a response line for a query of the given kind.
pub fn decode(kind: BlockQueryKind, line: &str) -> Result<BlockValue, QueryError> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return Err(decoding_error(line, "empty response"));
    }
    if trimmed == SERVER_ERROR_TOKEN {
        return Err(QueryError::Server(trimmed.to_string()));
    }

    match kind {
        BlockQueryKind::BlockType => parse_int(line, trimmed).map(BlockValue::Block),
        BlockQueryKind::WorldHeight => parse_int(line, trimmed).map(BlockValue::Height),
        BlockQueryKind::BlockTypeWithData => {
            let mut parts = trimmed.split(',');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(data), None) => Ok(BlockValue::BlockWithData {
                    id: parse_int(line, id.trim())?,
                    data: parse_int(line, data.trim())?,
                }),
                _ => Err(decoding_error(line, "expected \"id,data\"")),
            }
        }
    }
}

fn check_coordinate(axis: &str, value: i64) -> Result<(), QueryError> {
    if i32::try_from(value).is_err() {
        return Err(QueryError::Encoding(format!(
            "{axis} coordinate {value} is outside the 32-bit protocol range"
        )));
    }
    Ok(())
}

fn parse_int(line: &str, field: &str) -> Result<i32, QueryError> {
    field
        .parse::<i32>()
        .map_err(|e| decoding_error(line, &format!("invalid integer {field:?}: {e}")))
}

fn decoding_error(line: &str, reason: &str) -> QueryError {
    QueryError::Decoding {
        line: line.trim_end_matches(['\r', '\n']).to_string(),
        reason: reason.to_string(),
    }
}
