//! In-process block server speaking the Minecraft Pi text protocol.
//!
//! Answers every query line with one response line, in order. Positions
//! below y = 0 hold generated terrain; everything else is air unless set
//! with `world.setBlock`.

use mcpi_fast_query::{BlockQueryKind, BlockValue, Query};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type World = Arc<Mutex<HashMap<(i64, i64, i64), (i32, i32)>>>;

pub struct FakeServer {
    addr: String,
}

impl FakeServer {
    /// Start a server that answers forever.
    pub async fn start() -> FakeServer {
        Self::start_with_limit(None).await
    }

    /// Start a server that drops each connection after `limit` responses.
    pub async fn start_with_limit(limit: Option<usize>) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let world: World = Arc::default();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let world = Arc::clone(&world);
                tokio::spawn(serve(stream, world, limit));
            }
        });

        FakeServer { addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Value the server reports for a query, assuming nothing was set.
pub fn terrain(query: &Query) -> BlockValue {
    let (id, data) = terrain_block(query.x, query.y, query.z);
    match query.kind {
        BlockQueryKind::BlockType => BlockValue::Block(id),
        BlockQueryKind::BlockTypeWithData => BlockValue::BlockWithData { id, data },
        BlockQueryKind::WorldHeight => BlockValue::Height(-1),
    }
}

fn terrain_block(x: i64, y: i64, z: i64) -> (i32, i32) {
    if y < 0 {
        (1 + (x + z).rem_euclid(4) as i32, z.rem_euclid(16) as i32)
    } else {
        (0, 0)
    }
}

async fn serve(stream: TcpStream, world: World, limit: Option<usize>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut answered = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        if limit.is_some_and(|limit| answered >= limit) {
            return;
        }
        if let Some(response) = handle(&line, &world) {
            answered += 1;
            if writer.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn handle(line: &str, world: &World) -> Option<String> {
    let Some((command, rest)) = line.trim().split_once('(') else {
        return Some("Fail\n".to_string());
    };
    let args: Vec<i64> = match rest.strip_suffix(')') {
        Some(args) => match args.split(',').map(|a| a.trim().parse()).collect() {
            Ok(args) => args,
            Err(_) => return Some("Fail\n".to_string()),
        },
        None => return Some("Fail\n".to_string()),
    };

    let mut world = world.lock().unwrap();
    let response = match (command, args.as_slice()) {
        ("world.getBlock", &[x, y, z]) => block_at(&world, x, y, z).0.to_string(),
        ("world.getBlockWithData", &[x, y, z]) => {
            let (id, data) = block_at(&world, x, y, z);
            format!("{id},{data}")
        }
        ("world.getHeight", &[x, z]) => world
            .iter()
            .filter(|((bx, _, bz), (id, _))| *bx == x && *bz == z && *id != 0)
            .map(|((_, by, _), _)| *by)
            .fold(-1, i64::max)
            .to_string(),
        ("world.setBlock", &[x, y, z, id]) => {
            world.insert((x, y, z), (id as i32, 0));
            return None;
        }
        ("world.setBlock", &[x, y, z, id, data]) => {
            world.insert((x, y, z), (id as i32, data as i32));
            return None;
        }
        _ => "Fail".to_string(),
    };

    Some(format!("{response}\n"))
}

fn block_at(world: &HashMap<(i64, i64, i64), (i32, i32)>, x: i64, y: i64, z: i64) -> (i32, i32) {
    world
        .get(&(x, y, z))
        .copied()
        .unwrap_or_else(|| terrain_block(x, y, z))
}
