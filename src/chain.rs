//! Chain lifecycle, poll scheduling, and inbound dispatch.
//!
//! One [`ChainManager`] owns every connected chain: its transport halves,
//! its topology/registry/light state, the per-chain poll task, and the
//! response signal pairing polls with their replies. All tasks run on one
//! cooperative runtime; shared state sits behind a synchronous lock that
//! is never held across an await, and every writer flushes one whole
//! frame per turn, so the per-chain write path needs no further locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex as StateLock;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ChainConfig, DeviceNumber, DriverSettings, LightNumber, SwitchConfig};
use crate::error::{OppError, Result};
use crate::lights::Lights;
use crate::protocol::{self, Frame, OpCode};
use crate::registry::{Registry, RulePolicy, SwitchChange};
use crate::topology::{BoardKind, ChainTopology, InventoryState, CARD_TYPE_MASK};
use crate::transport::{self, ChainReader, DynSerial, SharedWriter};

/// How long the inventory handshake may take before the chain is declared
/// not ready.
const INVENTORY_TIMEOUT: Duration = Duration::from_secs(2);

/// Mutable per-chain state shared between inbound dispatch and host calls.
struct ChainState {
    topology: ChainTopology,
    registry: Registry,
    lights: Lights,
    /// Raw input words from the previous poll response, keyed by card.
    /// A card absent here has not delivered its initial full-state read.
    last_raw: HashMap<u8, u32>,
}

struct ChainConn {
    config: ChainConfig,
    writer: SharedWriter,
    state: Arc<StateLock<ChainState>>,
    /// Set when an input-state response arrives, consumed by the poll
    /// task before it issues the next request.
    poll_signal: Arc<Notify>,
    /// Batched read request covering every input-bearing board.
    read_inputs_msg: Vec<u8>,
    recv_task: JoinHandle<()>,
    poll_task: Option<JoinHandle<()>>,
    incand_task: Option<JoinHandle<()>>,
}

/// Owner of every connected chain and its tasks.
pub struct ChainManager {
    chains: HashMap<String, ChainConn>,
    event_tx: mpsc::UnboundedSender<SwitchChange>,
}

impl ChainManager {
    /// Create a manager and the receiver on which per-switch logical
    /// state changes are delivered.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SwitchChange>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                chains: HashMap::new(),
                event_tx,
            },
            event_rx,
        )
    }

    /// Open the configured serial device and run the inventory handshake.
    pub async fn connect(&mut self, serial: &str, config: ChainConfig) -> Result<()> {
        let port = transport::open_port(&config.port, config.baud_rate)
            .map_err(std::io::Error::other)?;
        self.connect_with_port(serial, config, port).await
    }

    /// Connect a chain over an already open transport. Used directly by
    /// tests driving a chain through an in-memory pipe.
    pub async fn connect_with_port(
        &mut self,
        serial: &str,
        config: ChainConfig,
        port: DynSerial,
    ) -> Result<()> {
        if self.chains.contains_key(serial) {
            return Err(OppError::AlreadyConnected(serial.to_string()));
        }
        let (reader, writer) = transport::split(port);
        let state = Arc::new(StateLock::new(ChainState {
            topology: ChainTopology::new(serial),
            registry: Registry::default(),
            lights: Lights::new(serial),
            last_raw: HashMap::new(),
        }));
        let poll_signal = Arc::new(Notify::new());
        let recv_task = tokio::spawn(receive_loop(
            serial.to_string(),
            reader,
            state.clone(),
            poll_signal.clone(),
            self.event_tx.clone(),
        ));

        let handshake = Self::run_handshake(serial, &writer, &state).await;
        let read_inputs_msg = match handshake {
            Ok(msg) => msg,
            Err(err) => {
                recv_task.abort();
                return Err(err);
            }
        };

        // Initial full-state read. Connect does not complete until every
        // input-bearing card has seeded its baseline; a change arriving
        // after connect is therefore always a delta, never lost into the
        // seed. The responses also leave the poll signal set for the
        // scheduler's first cycle.
        transport::send_frame(&writer, &read_inputs_msg).await?;
        let input_cards: Vec<u8> = {
            let s = state.lock();
            s.topology
                .boards
                .iter()
                .filter(|b| b.inputs > 0)
                .map(|b| b.card())
                .collect()
        };
        let seeded = wait_until(&state, INVENTORY_TIMEOUT, |s| {
            input_cards.iter().all(|card| s.last_raw.contains_key(card))
        })
        .await;
        if !seeded {
            recv_task.abort();
            return Err(OppError::InventoryIncomplete(serial.to_string()));
        }

        info!(chain = serial, "chain connected");
        self.chains.insert(
            serial.to_string(),
            ChainConn {
                config,
                writer,
                state,
                poll_signal,
                read_inputs_msg,
                recv_task,
                poll_task: None,
                incand_task: None,
            },
        );
        Ok(())
    }

    /// Inventory exchange: enumerate boards, then query each Gen2 board
    /// for its wing config and firmware version. Returns the batched
    /// read-inputs request for the enumerated chain.
    async fn run_handshake(
        serial: &str,
        writer: &SharedWriter,
        state: &Arc<StateLock<ChainState>>,
    ) -> Result<Vec<u8>> {
        transport::send_frame(writer, &protocol::build_inventory_request()).await?;
        if !wait_until(state, INVENTORY_TIMEOUT, |s| {
            s.topology.state() != InventoryState::Pending
        })
        .await
        {
            return Err(OppError::InventoryIncomplete(serial.to_string()));
        }

        let gen2_addrs: Vec<u8> = {
            let s = state.lock();
            if s.topology.state() == InventoryState::Failed {
                return Err(OppError::InventoryIncomplete(serial.to_string()));
            }
            s.topology
                .boards
                .iter()
                .filter(|b| b.kind == BoardKind::Gen2)
                .map(|b| b.addr)
                .collect()
        };
        for addr in &gen2_addrs {
            transport::send_frame(writer, &protocol::build_get_gen2_config(*addr)).await?;
            transport::send_frame(writer, &protocol::build_get_version(*addr)).await?;
        }
        if !wait_until(state, INVENTORY_TIMEOUT, |s| s.topology.is_ready()).await {
            return Err(OppError::InventoryIncomplete(serial.to_string()));
        }

        let mut s = state.lock();
        let registry = Registry::from_topology(&s.topology);
        s.registry = registry;
        let mut read_inputs_msg = Vec::new();
        for board in &s.topology.boards {
            if board.inputs > 0 {
                read_inputs_msg.extend(protocol::build_read_inputs(board.addr));
            }
        }
        let light_cards: Vec<(u8, u8, bool, bool)> = s
            .topology
            .boards
            .iter()
            .map(|b| (b.card(), b.addr, b.has_pixels, b.incands > 0))
            .collect();
        for (card, addr, pixels, incands) in light_cards {
            if pixels {
                s.lights.add_pixel_card(card, addr)?;
            }
            if incands {
                s.lights.add_incand_card(card, addr)?;
            }
        }
        debug!(chain = serial, "{}", s.topology.info_string());
        Ok(read_inputs_msg)
    }

    /// Start the poll and incandescent batching tasks for every
    /// connected chain.
    pub fn start(&mut self) {
        for (serial, conn) in &mut self.chains {
            if conn.poll_task.is_none() {
                conn.poll_task = Some(tokio::spawn(poll_loop(
                    serial.clone(),
                    conn.writer.clone(),
                    conn.poll_signal.clone(),
                    conn.read_inputs_msg.clone(),
                    conn.config.poll_hz,
                )));
            }
            if conn.incand_task.is_none() {
                conn.incand_task = Some(tokio::spawn(incand_loop(
                    conn.writer.clone(),
                    conn.state.clone(),
                    conn.config.incand_hz(),
                )));
            }
        }
    }

    /// Cancel every chain's tasks and close its transport.
    pub async fn stop(&mut self) {
        for (serial, mut conn) in self.chains.drain() {
            if let Some(task) = conn.poll_task.take() {
                task.abort();
            }
            if let Some(task) = conn.incand_task.take() {
                task.abort();
            }
            conn.recv_task.abort();
            info!(chain = %serial, "chain stopped");
        }
    }

    fn conn_for(&self, chain: &str, kind: &'static str) -> Result<&ChainConn> {
        self.chains.get(chain).ok_or_else(|| OppError::NotConnected {
            kind,
            chain: chain.to_string(),
        })
    }

    /// Store driver defaults and push the reconfigure to the board.
    pub async fn configure_driver(&self, number: &str, settings: DriverSettings) -> Result<()> {
        let number = DeviceNumber::parse(number)?;
        let conn = self.conn_for(&number.chain, "solenoid")?;
        let msg = conn.state.lock().registry.configure_driver(&number, settings)?;
        transport::send_frame(&conn.writer, &msg).await?;
        Ok(())
    }

    /// Configure a switch and return the handle used for rule binding.
    pub fn configure_switch(&self, number: &str, config: SwitchConfig) -> Result<DeviceNumber> {
        let number = DeviceNumber::parse(number)?;
        let conn = self.conn_for(&number.chain, "switch")?;
        conn.state.lock().registry.configure_switch(&number, config)
    }

    /// Install a hardware rule binding `switch` to `driver`.
    pub async fn install_rule(
        &self,
        switch: &DeviceNumber,
        driver: &str,
        policy: RulePolicy,
    ) -> Result<()> {
        let driver = DeviceNumber::parse(driver)?;
        let conn = self.conn_for(&driver.chain, "solenoid")?;
        let msgs = conn.state.lock().registry.install_rule(switch, &driver, policy)?;
        transport::send_frames(&conn.writer, &msgs).await?;
        Ok(())
    }

    /// Remove a hardware rule; disables firmware firing when the last
    /// binding goes away.
    pub async fn clear_rule(&self, switch: &DeviceNumber, driver: &str) -> Result<()> {
        let driver = DeviceNumber::parse(driver)?;
        let conn = self.conn_for(&driver.chain, "solenoid")?;
        let msgs = conn.state.lock().registry.clear_rule(switch, &driver)?;
        transport::send_frames(&conn.writer, &msgs).await?;
        Ok(())
    }

    /// Expand and register a light. Returns the channel numbers the host
    /// writes to afterwards.
    pub fn configure_light(&self, number: &str, subtype: &str) -> Result<Vec<String>> {
        let base = DeviceNumber::parse(number)?;
        let conn = self.conn_for(&base.chain, "light")?;
        let channels = Lights::parse_light_number_to_channels(number, subtype)?;
        let mut state = conn.state.lock();
        match subtype {
            "" | "led" => {
                for channel in &channels {
                    state.lights.configure_pixel(&LightNumber::parse(channel)?)?;
                }
            }
            _ => {
                if !state.lights.has_incand_card(base.card) {
                    return Err(OppError::UnknownNumber {
                        kind: "matrix light",
                        number: number.to_string(),
                    });
                }
            }
        }
        Ok(channels)
    }

    /// Write one pixel sub-channel; batched until [`Self::light_sync`].
    pub fn set_pixel(&self, number: &str, value: u8) -> Result<()> {
        let number = LightNumber::parse(number)?;
        let conn = self.conn_for(&number.chain, "light")?;
        conn.state.lock().lights.set_pixel_channel(&number, value)
    }

    /// Switch one incandescent lamp; batched until the incand pass runs.
    pub fn set_incand(&self, number: &str, on: bool) -> Result<()> {
        let number = LightNumber::parse(number)?;
        let conn = self.conn_for(&number.chain, "light")?;
        conn.state.lock().lights.set_incand(&number, on)
    }

    /// Flush dirty pixels on every chain.
    pub async fn light_sync(&self) -> Result<()> {
        for conn in self.chains.values() {
            let msgs = conn.state.lock().lights.light_sync();
            transport::send_frames(&conn.writer, &msgs).await?;
        }
        Ok(())
    }

    /// Flush dirty incandescent banks on every chain immediately.
    pub async fn update_incand(&self) -> Result<()> {
        for conn in self.chains.values() {
            let msgs = conn.state.lock().lights.update_incand();
            transport::send_frames(&conn.writer, &msgs).await?;
        }
        Ok(())
    }

    /// Logical switch states as seeded at connect time and updated by
    /// polling since, keyed by number string. Active-high.
    pub fn get_hw_switch_states(&self, chain: &str) -> Result<HashMap<String, bool>> {
        let conn = self.conn_for(chain, "switch")?;
        Ok(conn.state.lock().registry.switch_states())
    }

    /// Whether a chain completed its handshake and may be polled.
    pub fn is_ready(&self, chain: &str) -> bool {
        self.chains
            .get(chain)
            .map(|c| c.state.lock().topology.is_ready())
            .unwrap_or(false)
    }

    /// Human-readable inventory summary across chains.
    pub fn get_info_string(&self) -> String {
        if self.chains.is_empty() {
            return "No connection to any CPU board.".to_string();
        }
        let mut serials: Vec<_> = self.chains.keys().cloned().collect();
        serials.sort();
        serials
            .iter()
            .map(|s| self.chains[s].state.lock().topology.info_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Wait until `pred` holds on the chain state, or `timeout` elapses.
async fn wait_until(
    state: &Arc<StateLock<ChainState>>,
    timeout: Duration,
    pred: impl Fn(&ChainState) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred(&state.lock()) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Per-chain poll scheduler.
///
/// Each cycle waits for the previous response (bounded at 25 poll
/// intervals, warning but proceeding on timeout), sends the batched
/// read-inputs request, and then paces itself: sending back-to-back as
/// fast as the link allows overruns board firmware.
async fn poll_loop(
    serial: String,
    writer: SharedWriter,
    signal: Arc<Notify>,
    read_inputs_msg: Vec<u8>,
    poll_hz: f64,
) {
    let response_wait = Duration::from_secs_f64(25.0 / poll_hz);
    let pace = Duration::from_secs_f64(1.0 / poll_hz);
    loop {
        match tokio::time::timeout(response_wait, signal.notified()).await {
            Ok(()) => {}
            Err(_) => warn!(
                chain = %serial,
                "poll took more than {}ms",
                response_wait.as_millis()
            ),
        }
        if let Err(err) = transport::send_frame(&writer, &read_inputs_msg).await {
            warn!(chain = %serial, error = %err, "poll write failed");
        }
        tokio::time::sleep(pace).await;
    }
}

/// Periodic incandescent batching pass.
async fn incand_loop(writer: SharedWriter, state: Arc<StateLock<ChainState>>, hz: f64) {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / hz));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let msgs = state.lock().lights.update_incand();
        if let Err(err) = transport::send_frames(&writer, &msgs).await {
            warn!(error = %err, "incand write failed");
        }
    }
}

/// Receive loop: frame the byte stream, resynchronize on framing loss,
/// and dispatch well-formed messages. Framing errors never escape here.
async fn receive_loop(
    serial: String,
    mut reader: ChainReader,
    state: Arc<StateLock<ChainState>>,
    signal: Arc<Notify>,
    event_tx: mpsc::UnboundedSender<SwitchChange>,
) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        while let Some(frame) = protocol::decode(&mut buf) {
            if frame == Frame::ResyncNeeded {
                warn!(chain = %serial, "bad frame; resynchronizing on EOM");
                protocol::resync(&mut buf);
                continue;
            }
            dispatch_frame(&serial, frame, &state, &signal, &event_tx);
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!(chain = %serial, "transport closed");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(chain = %serial, error = %err, "transport read failed");
                break;
            }
        }
    }
}

fn dispatch_frame(
    serial: &str,
    frame: Frame,
    state: &Arc<StateLock<ChainState>>,
    signal: &Notify,
    event_tx: &mpsc::UnboundedSender<SwitchChange>,
) {
    let mut s = state.lock();
    match frame {
        Frame::Inventory(addrs) => {
            if let Err(err) = s.topology.apply_inventory(&addrs) {
                warn!(chain = serial, error = %err, "inventory response rejected");
            }
        }
        Frame::Message { addr, opcode, payload } => match opcode {
            OpCode::GetVersion => {
                let version = u32::from_be_bytes(payload[..4].try_into().expect("4-byte payload"));
                if let Err(err) = s.topology.apply_version(addr, version) {
                    warn!(chain = serial, error = %err, "version response rejected");
                }
            }
            OpCode::GetGen2Config => {
                let wings: [u8; 4] = payload[..4].try_into().expect("4-byte payload");
                if let Err(err) = s.topology.apply_gen2_config(addr, wings) {
                    warn!(chain = serial, error = %err, "gen2 config response rejected");
                }
            }
            OpCode::ReadInputs => {
                let raw = u32::from_be_bytes(payload[..4].try_into().expect("4-byte payload"));
                handle_inputs(&mut s, addr, raw, event_tx);
                signal.notify_one();
            }
            other => debug!(chain = serial, ?other, "unexpected message from board"),
        },
        Frame::ResyncNeeded => unreachable!("handled by the receive loop"),
    }
}

/// Apply an input-state response. The first word from a card seeds the
/// switch map; later words are diffed bit-by-bit. Raw levels are
/// active-low; the registry stores logical active-high.
fn handle_inputs(
    s: &mut ChainState,
    addr: u8,
    raw: u32,
    event_tx: &mpsc::UnboundedSender<SwitchChange>,
) {
    let card = addr & !CARD_TYPE_MASK;
    let inputs = s.topology.board(addr).map(|b| b.inputs).unwrap_or(0);
    match s.last_raw.insert(card, raw) {
        None => {
            for index in 0..inputs {
                s.registry
                    .seed_switch_state(card, index as u8, raw & (1 << index) == 0);
            }
        }
        Some(prior) => {
            let changed = u64::from(prior ^ raw) | (1 << 32);
            for index in protocol::set_bits(changed) {
                if u32::from(index) >= inputs {
                    continue;
                }
                let active = raw & (1 << index) == 0;
                if let Some(change) = s.registry.set_switch_state(card, index, active) {
                    let _ = event_tx.send(change);
                }
            }
        }
    }
}
