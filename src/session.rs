//! In-process prediction session
//!
//! Wires one authority world and one client world together through a pair of
//! loopback links. The client controls the player model and predicts it; the
//! authority also runs a bot on its own input, which the client only displays.
//!
//! Each frame runs in a fixed order:
//! 1. The client world advances, predicting the player and sending inputs
//! 2. The authority receives inputs that have arrived and advances
//! 3. Replication sends the new snapshots, control packets and events
//! 4. The client routes what has arrived to its drivers and refreshes its
//!    tick offset

use client::autonomous::AutonomousProxyDriver;
use client::offset::TickOffsetEstimator;
use client::simulated::SimulatedProxyDriver;
use log::{debug, info, warn};
use nalgebra::Vector3;
use server::authority::AuthorityDriver;
use server::replication::ReplicationManager;
use shared::demo::RunnerModel;
use shared::error::Result;
use shared::physics::{BodyHandle, PhysicsScene, PhysicsState};
use shared::state_manager::{InboundState, StateManager};
use shared::sync::lock;
use shared::tick::{Tick, TickInfo};
use shared::transport::{LinkStats, LoopbackLink, PacketSink, Reliability};
use shared::world::{TickCallback, WorldManager};
use shared::{ModelId, Packet, PredictionConfig, RigidBodyScene};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The model the client controls.
pub const PLAYER: ModelId = ModelId(1);
/// A model the authority drives itself.
pub const BOT: ModelId = ModelId(2);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// One-way delay of each link, in frames
    pub latency_frames: u64,
    /// Chance an unreliable packet is lost
    pub loss: f64,
    pub seed: u64,
    pub frame_dt: f64,
    /// Authority tick at which the player's body is knocked off its predicted path
    pub divergence_at: Option<Tick>,
    pub player_jump_every: Option<Tick>,
    pub prediction: PredictionConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let prediction = PredictionConfig::default();
        Self {
            latency_frames: 0,
            loss: 0.0,
            seed: 7,
            frame_dt: prediction.fixed_dt,
            divergence_at: None,
            player_jump_every: None,
            prediction,
        }
    }
}

/// Pushes a body sideways once, at the start of one tick.
struct Disturbance {
    body: BodyHandle,
    at: Tick,
    push: f64,
    applied: bool,
}

impl TickCallback for Disturbance {
    fn pre_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        if self.applied || info.local_tick != self.at {
            return Ok(());
        }

        let mut state = scene.body_state(self.body)?;
        state.x.x += self.push;
        scene.set_body_state(self.body, &state)?;
        self.applied = true;
        warn!("Pushed body {:?} by {} at tick {}", self.body, self.push, info.local_tick);
        Ok(())
    }
}

type Runner = RunnerModel;

pub struct Session {
    options: SessionOptions,
    server_world: WorldManager<RigidBodyScene>,
    server_states: StateManager,
    replication: ReplicationManager,
    player_authority: Arc<Mutex<AuthorityDriver<Runner>>>,
    bot_authority: Arc<Mutex<AuthorityDriver<Runner>>>,
    client_world: WorldManager<RigidBodyScene>,
    client_states: StateManager,
    inbound: BTreeMap<ModelId, mpsc::UnboundedReceiver<InboundState>>,
    player: Arc<Mutex<AutonomousProxyDriver<Runner>>>,
    bot: Arc<Mutex<SimulatedProxyDriver<Runner>>>,
    bot_events_displayed: Arc<AtomicU64>,
    offsets: TickOffsetEstimator,
    /// Client to authority
    uplink: LoopbackLink,
    /// Authority to client
    downlink: LoopbackLink,
    frames: u64,
}

impl Session {
    pub fn new(options: SessionOptions) -> Result<Self> {
        options.prediction.validate()?;
        let config = options.prediction.clone();
        let uplink = LoopbackLink::new(options.latency_frames, options.loss, options.seed);
        let downlink = LoopbackLink::new(options.latency_frames, options.loss, options.seed.wrapping_add(1));

        let player_model = RunnerModel {
            jump_every: options.player_jump_every,
            ..RunnerModel::running_right()
        };
        let bot_model = RunnerModel {
            jump_every: Some(45),
            ..RunnerModel::running_right()
        };
        let player_start = PhysicsState::default();
        let bot_start = PhysicsState::at_position(Vector3::new(0.0, 2.0, 0.0));

        // Authority
        let mut server_world = WorldManager::new(RigidBodyScene::default(), config.clone());
        server_world.set_server_tick_offset(0);
        let mut server_states = StateManager::new();
        let player_body = server_world.scene_mut().add_body(player_start);
        let bot_body = server_world.scene_mut().add_body(bot_start);

        if let Some(at) = options.divergence_at {
            server_world.register(Arc::new(Mutex::new(Disturbance {
                body: player_body,
                at,
                push: 0.5,
                applied: false,
            })));
        }

        let player_authority = Arc::new(Mutex::new(
            AuthorityDriver::new(
                PLAYER,
                player_model.clone(),
                player_body,
                player_start,
                config.clone(),
                Box::new(downlink.clone()),
            )
            .with_producer(server_states.register_producer(PLAYER)),
        ));
        let bot_authority = Arc::new(Mutex::new(
            AuthorityDriver::new(
                BOT,
                bot_model,
                bot_body,
                bot_start,
                config.clone(),
                Box::new(downlink.clone()),
            )
            .with_local_input()
            .with_producer(server_states.register_producer(BOT)),
        ));
        server_world.register(player_authority.clone());
        server_world.register(bot_authority.clone());

        let mut replication = ReplicationManager::new(&config);
        replication.add_connection(Box::new(downlink.clone()), [PLAYER]);

        // Client
        let mut client_world = WorldManager::new(RigidBodyScene::default(), config.clone());
        let mut client_states = StateManager::new();
        let player_body = client_world.scene_mut().add_body(player_start);
        let bot_body = client_world.scene_mut().add_body(bot_start);

        let player = Arc::new(Mutex::new(AutonomousProxyDriver::new(
            PLAYER,
            player_model,
            player_body,
            player_start,
            config.clone(),
            Box::new(uplink.clone()),
        )));

        let bot_events_displayed = Arc::new(AtomicU64::new(0));
        let displayed = bot_events_displayed.clone();
        let bot = Arc::new(Mutex::new(
            SimulatedProxyDriver::new(BOT, bot_body, &config).with_event_handler(move |record| {
                debug!("Bot {:?} displayed at local tick {}", record.event, record.local_tick);
                displayed.fetch_add(1, Ordering::Relaxed);
            }),
        ));
        client_world.register(player.clone());
        client_world.register(bot.clone());

        let mut inbound = BTreeMap::new();
        for model in [PLAYER, BOT] {
            let (tx, rx) = mpsc::unbounded_channel();
            client_states.register_consumer(model, tx);
            inbound.insert(model, rx);
        }

        info!(
            "Session ready: latency {} frames, loss {:.0}%",
            options.latency_frames,
            options.loss * 100.0
        );

        Ok(Self {
            offsets: TickOffsetEstimator::from_config(&config),
            options,
            server_world,
            server_states,
            replication,
            player_authority,
            bot_authority,
            client_world,
            client_states,
            inbound,
            player,
            bot,
            bot_events_displayed,
            uplink,
            downlink,
            frames: 0,
        })
    }

    pub fn player(&self) -> &Arc<Mutex<AutonomousProxyDriver<Runner>>> {
        &self.player
    }

    pub fn player_authority(&self) -> &Arc<Mutex<AuthorityDriver<Runner>>> {
        &self.player_authority
    }

    pub fn bot_authority(&self) -> &Arc<Mutex<AuthorityDriver<Runner>>> {
        &self.bot_authority
    }

    pub fn bot(&self) -> &Arc<Mutex<SimulatedProxyDriver<Runner>>> {
        &self.bot
    }

    pub fn client_world(&self) -> &WorldManager<RigidBodyScene> {
        &self.client_world
    }

    pub fn server_world(&self) -> &WorldManager<RigidBodyScene> {
        &self.server_world
    }

    pub fn run(&mut self, frames: u64) {
        for _ in 0..frames {
            self.frame();
        }
    }

    pub fn frame(&mut self) {
        let frame_dt = self.options.frame_dt;

        self.client_world.advance(frame_dt);

        for packet in self.uplink.receive() {
            self.deliver_to_authority(packet);
        }
        self.server_world.advance(frame_dt);
        self.replication
            .replicate(&mut self.server_states, self.server_world.latest_tick());

        for packet in self.downlink.receive() {
            self.deliver_to_client(packet);
        }
        self.route_inbound_states();
        self.refresh_tick_offset();

        self.uplink.advance_frame();
        self.downlink.advance_frame();
        self.frames += 1;
    }

    fn deliver_to_authority(&mut self, packet: Packet) {
        match packet {
            Packet::InputBundle { model: PLAYER, bytes } => {
                if let Err(e) = lock(&self.player_authority).receive_input_bundle(&bytes) {
                    warn!("Bad input bundle: {}", e);
                }
            }
            Packet::RemoteOffset { model: BOT, offset } => lock(&self.bot_authority).receive_remote_offset(offset),
            other => debug!("Authority ignoring {:?}", other),
        }
    }

    fn deliver_to_client(&mut self, packet: Packet) {
        match packet {
            Packet::AuthorityState { model, full, bytes } => {
                if let Err(e) = self.client_states.push_state_to_consumer(model, bytes, full) {
                    debug!("Dropping state: {}", e);
                }
            }
            Packet::Control { model: PLAYER, byte } => lock(&self.player).receive_control(byte),
            Packet::Events { model: BOT, bytes } => {
                if let Err(e) = lock(&self.bot).receive_events(&bytes) {
                    warn!("Bad event bundle: {}", e);
                }
            }
            Packet::ServerTick { tick } => self.offsets.observe_server_tick(tick),
            other => debug!("Client ignoring {:?}", other),
        }
    }

    fn route_inbound_states(&mut self) {
        for (model, rx) in &mut self.inbound {
            while let Ok(InboundState { bytes, full }) = rx.try_recv() {
                let result = if *model == PLAYER {
                    lock(&self.player).receive_authority_state(&bytes)
                } else {
                    lock(&self.bot).receive_authority_state(&bytes, full)
                };
                if let Err(e) = result {
                    warn!("Bad state for {:?}: {}", model, e);
                }
            }
        }
    }

    fn refresh_tick_offset(&mut self) {
        let local = self.client_world.latest_tick().unwrap_or(0);
        let Some(offset) = self.offsets.update(local) else {
            return;
        };

        // The world maps local to server ticks the other way round.
        self.client_world.set_server_tick_offset(-offset.server_tick_offset);
        lock(&self.bot).set_tick_offset(offset.server_tick_offset);
        self.uplink
            .send(Packet::RemoteOffset { model: BOT, offset }, Reliability::Reliable);
    }

    pub fn report(&self) -> SessionReport {
        let player = lock(&self.player);
        let authority = lock(&self.player_authority);
        let world = self.client_world.stats();
        SessionReport {
            frames: self.frames,
            server_tick: self.server_world.latest_tick(),
            client_tick: self.client_world.latest_tick(),
            acked_tick: player.acked_tick(),
            corrections: player.stats().corrections,
            rewinds: world.rewinds,
            resimulated_ticks: world.resimulated_ticks,
            forced_ticks: world.forced_ticks,
            recently_synthesized: authority.input_buffer().recently_dropped(),
            control_packets: authority.stats().control_packets_sent,
            bot_events_displayed: self.bot_events_displayed.load(Ordering::Relaxed),
            tick_offset: self.offsets.offset(),
            uplink: self.uplink.stats(),
            downlink: self.downlink.stats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub frames: u64,
    pub server_tick: Option<Tick>,
    pub client_tick: Option<Tick>,
    pub acked_tick: Option<Tick>,
    pub corrections: u64,
    pub rewinds: u64,
    pub resimulated_ticks: u64,
    pub forced_ticks: u64,
    /// Inputs the authority had to fill in lately
    pub recently_synthesized: usize,
    pub control_packets: u64,
    pub bot_events_displayed: u64,
    pub tick_offset: Option<i32>,
    pub uplink: LinkStats,
    pub downlink: LinkStats,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Frames:              {}", self.frames)?;
        writeln!(f, "Authority tick:      {:?}", self.server_tick)?;
        writeln!(f, "Client tick:         {:?}", self.client_tick)?;
        writeln!(f, "Acknowledged input:  {:?}", self.acked_tick)?;
        writeln!(f, "Tick offset:         {:?}", self.tick_offset)?;
        writeln!(f, "Corrections:         {}", self.corrections)?;
        writeln!(
            f,
            "Rewinds:             {} ({} ticks replayed)",
            self.rewinds, self.resimulated_ticks
        )?;
        writeln!(f, "Forced ticks:        {}", self.forced_ticks)?;
        writeln!(f, "Synthesized inputs:  {}", self.recently_synthesized)?;
        writeln!(f, "Control packets:     {}", self.control_packets)?;
        writeln!(f, "Bot events shown:    {}", self.bot_events_displayed)?;
        writeln!(
            f,
            "Uplink:              {} sent, {} dropped",
            self.uplink.sent, self.uplink.dropped
        )?;
        write!(
            f,
            "Downlink:            {} sent, {} dropped",
            self.downlink.sent, self.downlink.dropped
        )
    }
}
