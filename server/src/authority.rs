//! Authoritative simulation of one model
//!
//! The authority is the single source of truth for a simulated object. Each
//! physics tick it:
//! - Takes the next input, received from the owning client or produced locally
//! - Runs the model against the body and captures the resulting snapshot
//! - Freezes the body and marks the snapshot final when the model says so
//! - Publishes full and reduced encodings for replication
//! - Feeds input buffer occupancy into the time dilation estimator
//!
//! After each frame the driver flushes control packets and event bundles to
//! its packet sink. Missing inputs never stall the authority; they are
//! synthesized by the input buffer.

use crate::dilation::TimeDilationEstimator;
use crate::input_buffer::AuthorityInputBuffer;
use log::{debug, info, trace, warn};
use shared::config::PredictionConfig;
use shared::control::ControlPacket;
use shared::error::Result;
use shared::events::{EventQueue, RemoteProxyOffset};
use shared::history::StateHistory;
use shared::input::InputPacket;
use shared::model::{ModelRunner, SimModel, TickResult};
use shared::physics::{BodyHandle, PhysicsScene, PhysicsState};
use shared::snapshot::StateSnapshot;
use shared::state_manager::{ModelId, ProducedState, StateProducer};
use shared::sync::Handoff;
use shared::tick::TickInfo;
use shared::transport::{PacketSink, Reliability};
use shared::wire::{decode_input_bundle, encode_snapshot, Completeness};
use shared::world::{FrameContext, TickCallback};
use shared::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityPhase {
    /// Holding the body until enough remote input has been buffered
    WaitingForInput,
    Ticking,
}

/// Counters for monitoring one authority driver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuthorityStats {
    pub ticks_simulated: u64,
    pub ticks_waiting: u64,
    pub control_packets_sent: u64,
    pub event_bundles_sent: u64,
    pub events_executed: u64,
    pub snapshots_published: u64,
}

pub struct AuthorityDriver<M: SimModel> {
    model_id: ModelId,
    config: PredictionConfig,
    runner: ModelRunner<M>,
    phase: AuthorityPhase,
    /// Produce input locally instead of waiting for a client
    produces_input: bool,
    inbound_inputs: Handoff<Vec<InputPacket<M::Input>>>,
    inputs: AuthorityInputBuffer<M::Input>,
    tick_input: Option<InputPacket<M::Input>>,
    history: StateHistory<M::State>,
    dilation: TimeDilationEstimator,
    outbound_control: Option<ControlPacket>,
    events: EventQueue<M::Event>,
    producer: Option<StateProducer>,
    published_final: bool,
    sink: Box<dyn PacketSink>,
    stats: AuthorityStats,
}

impl<M: SimModel> AuthorityDriver<M> {
    pub fn new(
        model_id: ModelId,
        model: M,
        body: BodyHandle,
        initial_physics: PhysicsState,
        config: PredictionConfig,
        sink: Box<dyn PacketSink>,
    ) -> Self {
        info!("Authority for {:?} bound to body {:?}", model_id, body);
        Self {
            model_id,
            runner: ModelRunner::new(model, body, initial_physics),
            phase: AuthorityPhase::WaitingForInput,
            produces_input: false,
            inbound_inputs: Handoff::new(),
            inputs: AuthorityInputBuffer::new(config.dropped_packet_memory_tick_length),
            tick_input: None,
            history: StateHistory::with_capacity(config.history_capacity()),
            dilation: TimeDilationEstimator::from_config(&config),
            outbound_control: None,
            events: EventQueue::new(),
            producer: None,
            published_final: false,
            sink,
            stats: AuthorityStats::default(),
            config,
        }
    }

    /// Makes the authority its own input source, for objects nobody controls.
    pub fn with_local_input(mut self) -> Self {
        self.produces_input = true;
        self.phase = AuthorityPhase::Ticking;
        self
    }

    pub fn with_producer(mut self, producer: StateProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn phase(&self) -> AuthorityPhase {
        self.phase
    }

    pub fn runner(&self) -> &ModelRunner<M> {
        &self.runner
    }

    pub fn history(&self) -> &StateHistory<M::State> {
        &self.history
    }

    pub fn current(&self) -> &StateSnapshot<M::State> {
        self.runner.current()
    }

    pub fn input_buffer(&self) -> &AuthorityInputBuffer<M::Input> {
        &self.inputs
    }

    pub fn events(&self) -> &EventQueue<M::Event> {
        &self.events
    }

    pub fn stats(&self) -> AuthorityStats {
        self.stats
    }

    /// Accepts a sliding window of inputs from the owning client.
    pub fn receive_input_bundle(&mut self, bytes: &[u8]) -> Result<()> {
        let packets = decode_input_bundle::<M::Input>(bytes)?;
        trace!("{:?} received {} inputs", self.model_id, packets.len());
        self.inbound_inputs.push(packets);
        Ok(())
    }

    /// Queues the offset observers use to display this model.
    pub fn receive_remote_offset(&mut self, offset: RemoteProxyOffset) {
        self.events.consume_remote_offset(offset);
    }

    fn select_input(&mut self, info: &TickInfo) -> Option<InputPacket<M::Input>> {
        if self.produces_input {
            let mut input = M::Input::default();
            self.runner.model_mut().produce_input(info.local_tick, &mut input);
            return Some(InputPacket::new(info.local_tick, input));
        }

        if self.phase == AuthorityPhase::WaitingForInput {
            if self.inputs.len() < self.config.desired_input_buffer_size {
                return None;
            }
            info!(
                "{:?} input buffer reached {} packets, ticking from tick {}",
                self.model_id,
                self.inputs.len(),
                info.local_tick
            );
            self.phase = AuthorityPhase::Ticking;
        }

        self.inputs.next_input()
    }

    fn publish(&mut self, snapshot: &StateSnapshot<M::State>) -> Result<()> {
        if self.published_final {
            return Ok(());
        }
        let Some(producer) = &self.producer else {
            return Ok(());
        };

        let Some(tick) = snapshot.server_tick.or(snapshot.local_tick) else {
            return Ok(());
        };

        let state = ProducedState {
            short: encode_snapshot(snapshot, Completeness::Reduced)?,
            full: encode_snapshot(snapshot, Completeness::Full)?,
            reliable: snapshot.events != 0 || snapshot.is_final,
        };

        if producer.publish(tick, state) {
            self.stats.snapshots_published += 1;
        } else {
            warn!("{:?} state registry is gone, no longer publishing", self.model_id);
            self.producer = None;
        }

        if snapshot.is_final {
            info!("{:?} published final state at tick {}", self.model_id, tick);
            self.published_final = true;
        }
        Ok(())
    }
}

impl<M: SimModel> TickCallback for AuthorityDriver<M> {
    fn prepare_tick(&mut self, info: &TickInfo) {
        for packets in self.inbound_inputs.drain() {
            self.inputs.enqueue(packets);
        }

        self.tick_input = self.select_input(info);

        if !self.produces_input {
            if let Some(control) = self.dilation.update(self.inputs.len(), self.inputs.recently_dropped()) {
                self.outbound_control = Some(control);
            }
        }

        self.events.prepare_pre_physics(info);
    }

    fn pre_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        match self.tick_input.take() {
            Some(input) => self.runner.pre_tick(info, scene, input),
            None => {
                self.stats.ticks_waiting += 1;
                self.runner.hold(scene)
            }
        }
    }

    fn post_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        let Some(TickResult { mut snapshot, events }) = self.runner.post_tick(info, scene)? else {
            // Waiting for input; undo whatever the solver did to the held body.
            return self.runner.hold(scene);
        };

        // The authority's own ticks are server ticks.
        snapshot.server_tick.get_or_insert(info.local_tick);

        for event in events {
            self.events.dispatch(event, info);
        }

        self.history.update(snapshot.clone());
        self.publish(&snapshot)?;
        self.stats.ticks_simulated += 1;
        Ok(())
    }

    fn post_physics(&mut self, frame: &mut FrameContext) {
        if let Some(control) = self.outbound_control.take() {
            self.sink.send(
                Packet::Control {
                    model: self.model_id,
                    byte: control.pack(),
                },
                Reliability::Unreliable,
            );
            self.stats.control_packets_sent += 1;
        }

        match self.events.emit() {
            Ok(Some(bytes)) => {
                self.sink.send(
                    Packet::Events {
                        model: self.model_id,
                        bytes,
                    },
                    Reliability::Reliable,
                );
                self.stats.event_bundles_sent += 1;
            }
            Ok(None) => {}
            Err(e) => warn!("{:?} failed to emit events: {}", self.model_id, e),
        }

        let model_id = self.model_id;
        let remote_offset = self.events.remote_offset();
        let executed = self.events.execute(frame.results_time, remote_offset, |record| {
            debug!(
                "{:?} executed {:?} from server tick {:?}, observers display it at {:?}",
                model_id,
                record.event,
                record.server_tick,
                record.server_tick.zip(remote_offset).map(|(tick, offset)| tick + offset)
            );
        });
        self.stats.events_executed += executed as u64;
    }
}
