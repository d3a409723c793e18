//! # navigation
//!
//! DesBridge telemetry ingest. Runs a TCP server the sensor-fusion bridge
//! connects to, parses `$NAVIGATION` telegrams into [`NavigationFrame`]s and
//! publishes each one to a single-slot [`NavigationStore`] read by the
//! virtual-slope loop and the phase manager.
//!
//! Wire format (line-terminated ASCII):
//!   - `$HBEAT…` — peer heartbeat, consumed silently
//!   - `$NAVIGATION,f1,…,fN[*checksum]` — comma-separated floats, `UNDEF` or
//!     empty for unavailable sensors; at least 10 fields required to publish
//!
//! The server answers every accepted connection with `$R_HBEAT\r\n` once per
//! second for as long as the connection lives. Socket errors never take the
//! process down: the client is cleaned up and the accept loop resumes.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

// ── Navigation frame ──────────────────────────────────────────────────────────

/// One snapshot of vehicle telemetry from a `$NAVIGATION` telegram.
///
/// Every field is optional: any sensor may report `UNDEF`. Field numbers
/// below are the 1-based indices in the telegram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NavigationFrame {
    // Position (fields 1-6)
    pub latitude: Option<f64>,           // 1: latitude (°)
    pub longitude: Option<f64>,          // 2: longitude (°)
    pub sigmapos: Option<f64>,           // 3: position error estimate (m)
    pub depth: Option<f64>,              // 4: depth (m, positive down)
    pub altitude: Option<f64>,           // 5: altitude above seafloor (m)
    pub seabed: Option<f64>,             // 6: water column height (m)

    // Ground-referenced velocity, geographic frame (fields 7-10)
    pub north_speed: Option<f64>,        // 7 (m/s)
    pub east_speed: Option<f64>,         // 8 (m/s)
    pub down_speed: Option<f64>,         // 9 (m/s)
    pub up_speed: Option<f64>,           // 10 (m/s)

    // Ground-referenced velocity, body frame (fields 11-13)
    pub u_speed: Option<f64>,            // 11 (m/s)
    pub v_speed: Option<f64>,            // 12 (m/s)
    pub w_speed: Option<f64>,            // 13 (m/s)

    // Water velocity, geographic frame (fields 14-17)
    pub water_north_speed: Option<f64>,  // 14 (m/s)
    pub water_east_speed: Option<f64>,   // 15 (m/s)
    pub water_down_speed: Option<f64>,   // 16 (m/s)
    pub water_up_speed: Option<f64>,     // 17 (m/s)

    // Water velocity, body frame (fields 18-20)
    pub water_u_speed: Option<f64>,      // 18 (m/s)
    pub water_v_speed: Option<f64>,      // 19 (m/s)
    pub water_w_speed: Option<f64>,      // 20 (m/s)

    // Current velocity (fields 21-22)
    pub current_north_speed: Option<f64>, // 21 (m/s)
    pub current_east_speed: Option<f64>,  // 22 (m/s)

    // Orientation (fields 23-25)
    pub heading: Option<f64>,            // 23: heading (°, positive to starboard)
    pub roll: Option<f64>,               // 24: roll (°, positive port side up)
    pub pitch: Option<f64>,              // 25: pitch (°, positive bow up)

    // Angular rates (fields 26-31)
    pub yaw_rate: Option<f64>,           // 26 (°/s)
    pub roll_rate: Option<f64>,          // 27 (°/s)
    pub pitch_rate: Option<f64>,         // 28 (°/s)
    pub p: Option<f64>,                  // 29: angular velocity, X axis (°/s)
    pub q: Option<f64>,                  // 30: angular velocity, Y axis (°/s)
    pub r: Option<f64>,                  // 31: angular velocity, Z axis (°/s)

    // Accelerations (fields 32-34)
    pub ax: Option<f64>,                 // 32 (m/s², gravity compensated)
    pub ay: Option<f64>,                 // 33 (m/s²)
    pub az: Option<f64>,                 // 34 (m/s²)
}

// ── Snapshot store ────────────────────────────────────────────────────────────

/// Latest-value cache for navigation frames: one writer (the ingest task),
/// many readers. No history.
#[derive(Clone, Default)]
pub struct NavigationStore {
    inner: Arc<RwLock<Option<NavigationFrame>>>,
}

impl NavigationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, frame: NavigationFrame) {
        *self.inner.write().await = Some(frame);
    }

    pub async fn get(&self) -> Option<NavigationFrame> {
        *self.inner.read().await
    }
}

// ── Telegram parsing ──────────────────────────────────────────────────────────

/// Parse one float field; `UNDEF` (any case) and empty map to absent, as does
/// anything that fails to parse.
fn parse_field(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("UNDEF") {
        return None;
    }
    trimmed.parse().ok()
}

/// Parse a `$NAVIGATION` line into a frame. Returns `None` when the telegram
/// carries fewer than 10 fields (not worth publishing).
pub fn parse_navigation(line: &str) -> Option<NavigationFrame> {
    // Drop any *checksum suffix before splitting
    let body = line.split('*').next().unwrap_or(line);
    let fields: Vec<&str> = body.split(',').collect();

    if fields.len() < 10 {
        return None;
    }

    let field = |i: usize| fields.get(i).copied().and_then(parse_field);

    Some(NavigationFrame {
        latitude: field(1),
        longitude: field(2),
        sigmapos: field(3),
        depth: field(4),
        altitude: field(5),
        seabed: field(6),
        north_speed: field(7),
        east_speed: field(8),
        down_speed: field(9),
        up_speed: field(10),
        u_speed: field(11),
        v_speed: field(12),
        w_speed: field(13),
        water_north_speed: field(14),
        water_east_speed: field(15),
        water_down_speed: field(16),
        water_up_speed: field(17),
        water_u_speed: field(18),
        water_v_speed: field(19),
        water_w_speed: field(20),
        current_north_speed: field(21),
        current_east_speed: field(22),
        heading: field(23),
        roll: field(24),
        pitch: field(25),
        yaw_rate: field(26),
        roll_rate: field(27),
        pitch_rate: field(28),
        p: field(29),
        q: field(30),
        r: field(31),
        ax: field(32),
        ay: field(33),
        az: field(34),
    })
}

async fn process_line(line: &str, store: &NavigationStore) {
    if line.starts_with("$HBEAT") {
        // Heartbeat response from the peer, nothing to do
    } else if line.starts_with("$NAVIGATION") {
        match parse_navigation(line) {
            Some(frame) => store.put(frame).await,
            None => debug!("Dropped short NAVIGATION telegram: {line}"),
        }
    }
    // All other sentences are ignored
}

// ── Server task ───────────────────────────────────────────────────────────────

/// Run the DesBridge TCP server for the process lifetime. One client is
/// served at a time; further connection attempts queue in the listen backlog.
pub async fn run_desbridge_server(host: String, port: u16, store: NavigationStore) {
    let addr = format!("{host}:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => {
            info!("DesBridge server listening on {addr}");
            l
        }
        Err(e) => {
            warn!("DesBridge server: could not bind {addr}: {e}");
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("DesBridge connected from {peer}");
                if let Err(e) = handle_client(stream, &store).await {
                    warn!("DesBridge client error: {e}");
                }
                info!("Connection closed; waiting for new connection...");
            }
            Err(e) => {
                warn!("DesBridge accept error: {e}");
            }
        }
    }
}

async fn handle_client(stream: TcpStream, store: &NavigationStore) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();

    let heartbeat = tokio::spawn(send_heartbeat(writer));
    let result = read_telegrams(reader, store).await;
    heartbeat.abort();

    result
}

/// Write `$R_HBEAT\r\n` once per second until the peer goes away.
async fn send_heartbeat(mut writer: OwnedWriteHalf) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if writer.write_all(b"$R_HBEAT\r\n").await.is_err() {
            break;
        }
    }
}

async fn read_telegrams(mut reader: OwnedReadHalf, store: &NavigationStore) -> std::io::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                process_line(line, store).await;
            }
        }
    }
}
