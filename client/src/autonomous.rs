//! Client-side prediction for the model this peer controls
//!
//! The autonomous proxy runs its model ahead of the authority, one predicted
//! tick per local tick, and remembers every predicted snapshot. Inputs go out
//! every frame as a sliding window of the newest few ticks so a single lost
//! packet never starves the authority.
//!
//! When an authority snapshot comes back it is compared against the local
//! prediction for the same input tick:
//! - A match acknowledges every input up to that tick
//! - A mismatch installs the authority state as a correction for the following
//!   tick and asks the world to rewind and replay from there with the buffered
//!   inputs
//! - A snapshot ahead of the prediction fast-forwards the proxy instead
//!
//! Control packets from the authority scale the local simulation rate so the
//! authority's input buffer stays at its target depth.

use crate::input_buffer::AutoProxyInputBuffer;
use log::{debug, error, info, trace, warn};
use shared::config::PredictionConfig;
use shared::control::ControlPacket;
use shared::error::{Result, SimError};
use shared::events::EventQueue;
use shared::history::StateHistory;
use shared::input::InputPacket;
use shared::model::{ModelRunner, SimModel, TickResult};
use shared::physics::{BodyHandle, PhysicsScene, PhysicsState};
use shared::snapshot::StateSnapshot;
use shared::state_manager::ModelId;
use shared::sync::Handoff;
use shared::tick::{Tick, TickInfo};
use shared::transport::{PacketSink, Reliability};
use shared::wire::{decode_snapshot, encode_input_bundle, Completeness};
use shared::world::{FrameContext, TickCallback};
use shared::Packet;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AutonomousStats {
    pub ticks_predicted: u64,
    pub ticks_replayed: u64,
    pub matches: u64,
    pub corrections: u64,
    pub history_misses: u64,
    pub missing_inputs: u64,
    pub stale_states: u64,
    pub input_bundles_sent: u64,
    pub events_executed: u64,
}

/// Authority state waiting to be written onto the body.
#[derive(Debug, Clone)]
struct Correction<S> {
    /// Tick at whose start the state is applied
    target: Tick,
    snapshot: StateSnapshot<S>,
}

pub struct AutonomousProxyDriver<M: SimModel> {
    model_id: ModelId,
    config: PredictionConfig,
    runner: ModelRunner<M>,
    inputs: AutoProxyInputBuffer<M::Input>,
    history: StateHistory<M::State>,
    inbound_states: Handoff<StateSnapshot<M::State>>,
    /// Received authority states keyed by the input tick they consumed
    pending_states: BTreeMap<Tick, StateSnapshot<M::State>>,
    correction: Option<Correction<M::State>>,
    acked_tick: Option<Tick>,
    /// Newest input tick among the authority states received this frame
    newest_received_input: Option<Tick>,
    /// Set when a replay ran out of input; the next authority state is taken as is.
    resync: bool,
    consecutive_corrections: u32,
    control: Option<ControlPacket>,
    time_dilation: f64,
    forced_ticks: u32,
    last_forced_request: u32,
    /// Inputs produced since the last bundle went out
    unsent_inputs: usize,
    events: EventQueue<M::Event>,
    sink: Box<dyn PacketSink>,
    stats: AutonomousStats,
}

impl<M: SimModel> AutonomousProxyDriver<M> {
    pub fn new(
        model_id: ModelId,
        model: M,
        body: BodyHandle,
        initial_physics: PhysicsState,
        config: PredictionConfig,
        sink: Box<dyn PacketSink>,
    ) -> Self {
        info!("Autonomous proxy for {:?} bound to body {:?}", model_id, body);
        Self {
            model_id,
            runner: ModelRunner::new(model, body, initial_physics),
            inputs: AutoProxyInputBuffer::new(config.history_capacity()),
            history: StateHistory::with_capacity(config.history_capacity()),
            inbound_states: Handoff::new(),
            pending_states: BTreeMap::new(),
            correction: None,
            acked_tick: None,
            newest_received_input: None,
            resync: false,
            consecutive_corrections: 0,
            control: None,
            time_dilation: 1.0,
            forced_ticks: 0,
            last_forced_request: 0,
            unsent_inputs: 0,
            events: EventQueue::new(),
            sink,
            stats: AutonomousStats::default(),
            config,
        }
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn runner(&self) -> &ModelRunner<M> {
        &self.runner
    }

    pub fn current(&self) -> &StateSnapshot<M::State> {
        self.runner.current()
    }

    pub fn history(&self) -> &StateHistory<M::State> {
        &self.history
    }

    pub fn input_buffer(&self) -> &AutoProxyInputBuffer<M::Input> {
        &self.inputs
    }

    pub fn events(&self) -> &EventQueue<M::Event> {
        &self.events
    }

    /// Newest input tick the authority confirmed.
    pub fn acked_tick(&self) -> Option<Tick> {
        self.acked_tick
    }

    /// Tick and state of the correction waiting to be applied, if any.
    pub fn pending_correction(&self) -> Option<(Tick, &StateSnapshot<M::State>)> {
        self.correction
            .as_ref()
            .map(|correction| (correction.target, &correction.snapshot))
    }

    /// Size of the most recent forced simulation request.
    pub fn forced_ticks_requested(&self) -> u32 {
        self.last_forced_request
    }

    /// Rate scale requested after the last frame.
    pub fn time_dilation(&self) -> f64 {
        self.time_dilation
    }

    pub fn stats(&self) -> AutonomousStats {
        self.stats
    }

    /// Accepts a full authority snapshot for this model.
    pub fn receive_authority_state(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot = decode_snapshot::<M::State>(bytes, Completeness::Full)?;
        trace!(
            "{:?} received authority state for input tick {:?}",
            self.model_id,
            snapshot.input_tick
        );
        self.inbound_states.push(snapshot);
        Ok(())
    }

    pub fn receive_control(&mut self, byte: u8) {
        let control = ControlPacket::unpack(byte);
        if control.input_buffer_unhealthy && !self.control.is_some_and(|c| c.input_buffer_unhealthy) {
            debug!("{:?} authority input buffer reported unhealthy", self.model_id);
        }
        self.control = Some(control);
    }

    fn request_forced_ticks(&mut self, ticks: u32) {
        self.forced_ticks = self.forced_ticks.max(ticks);
        self.last_forced_request = ticks;
    }

    fn replay_depth(&self) -> u32 {
        self.config.forward_prediction_ticks.max(self.inputs.len() as u32)
    }

    fn acknowledge(&mut self, input_tick: Tick) {
        self.inputs.ack(input_tick);
        self.acked_tick = Some(self.acked_tick.map_or(input_tick, |acked| acked.max(input_tick)));
    }

    fn install_correction(&mut self, target: Tick, snapshot: StateSnapshot<M::State>, input_tick: Tick) {
        self.correction = Some(Correction { target, snapshot });
        self.resync = false;
        self.stats.corrections += 1;
        self.consecutive_corrections += 1;
        if self.consecutive_corrections > self.config.correction_warn_threshold {
            warn!(
                "{:?} corrected at input tick {} ({} corrections in a row)",
                self.model_id, input_tick, self.consecutive_corrections
            );
        } else {
            debug!("{:?} corrected at input tick {}", self.model_id, input_tick);
        }
    }

    /// Compares one authority state with the local prediction. Returns the
    /// tick to replay from, if any.
    fn reconcile(&mut self, authority: StateSnapshot<M::State>, input_tick: Tick, latest: Tick) -> Option<Tick> {
        if input_tick > latest {
            warn!(
                "{:?} authority consumed input {} ahead of prediction at {}, fast forwarding",
                self.model_id, input_tick, latest
            );
            // Inputs for the ticks still to be predicted stay buffered.
            self.inputs.ack(latest);
            self.acked_tick = Some(input_tick);
            self.install_correction(input_tick + 1, authority, input_tick);
            let ahead = (input_tick - latest) as u32;
            self.request_forced_ticks(ahead + self.replay_depth());
            return None;
        }

        let oldest_replayable = latest - self.config.rewind_buffer_ticks();
        if input_tick + 1 < oldest_replayable {
            debug!(
                "{:?} authority state for input tick {} is outside the rewind window",
                self.model_id, input_tick
            );
            self.stats.stale_states += 1;
            self.acknowledge(input_tick);
            return None;
        }

        let Some(predicted) = self.history.lookup(input_tick) else {
            let err = SimError::HistoryMiss { tick: input_tick };
            error!("{:?} cannot reconcile: {}, snapping to authority", self.model_id, err);
            self.stats.history_misses += 1;
            self.acknowledge(input_tick);
            self.install_correction(latest + 1, authority, input_tick);
            self.request_forced_ticks(self.replay_depth());
            return None;
        };

        if !self.resync && !authority.should_reconcile(predicted, &self.config.tolerances) {
            trace!("{:?} prediction for input tick {} confirmed", self.model_id, input_tick);
            self.stats.matches += 1;
            self.consecutive_corrections = 0;
            self.acknowledge(input_tick);
            return None;
        }

        // Re-key the authority state onto the local timeline.
        let corrected = StateSnapshot {
            local_tick: predicted.local_tick,
            input_tick: Some(input_tick),
            start_time: predicted.start_time,
            end_time: predicted.end_time,
            ..authority
        };
        self.history.update(corrected.clone());
        self.events.rewind(input_tick + 1);
        self.acknowledge(input_tick);
        self.install_correction(input_tick + 1, corrected, input_tick);
        self.request_forced_ticks(self.replay_depth());
        Some(input_tick + 1)
    }

    fn apply_correction(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<bool> {
        let Some(target) = self.correction.as_ref().map(|correction| correction.target) else {
            return Ok(false);
        };

        if target < info.local_tick && !info.is_resim {
            debug!(
                "{:?} dropping correction for tick {}, already at {}",
                self.model_id, target, info.local_tick
            );
            self.correction = None;
            return Ok(false);
        }
        if target != info.local_tick {
            return Ok(false);
        }

        let Some(Correction { snapshot, .. }) = self.correction.take() else {
            return Ok(false);
        };
        debug!("{:?} applying authority state at tick {}", self.model_id, target);
        self.runner.apply_state(scene, snapshot)?;
        Ok(true)
    }
}

impl<M: SimModel> TickCallback for AutonomousProxyDriver<M> {
    fn prepare_tick(&mut self, info: &TickInfo) {
        if info.server_tick.is_none() {
            return;
        }

        let mut input = M::Input::default();
        self.runner.model_mut().produce_input(info.local_tick, &mut input);
        self.inputs.enqueue(InputPacket::new(info.local_tick, input));
        self.unsent_inputs += 1;
    }

    fn rewind_tick(&mut self, latest_tick: Tick) -> Option<Tick> {
        for snapshot in self.inbound_states.drain() {
            let Some(input_tick) = snapshot.input_tick else {
                warn!("{:?} authority state without an input tick", self.model_id);
                continue;
            };
            if self.acked_tick.is_some_and(|acked| input_tick <= acked) {
                trace!("{:?} ignoring already acknowledged input tick {}", self.model_id, input_tick);
                continue;
            }
            self.newest_received_input = Some(self.newest_received_input.map_or(input_tick, |t| t.max(input_tick)));
            self.pending_states.insert(input_tick, snapshot);
        }

        // Later states are compared once the replay has rewritten the history.
        let mut rewind = None;
        while self.correction.is_none() {
            let Some((input_tick, snapshot)) = self.pending_states.pop_first() else {
                break;
            };
            if self.acked_tick.is_some_and(|acked| input_tick <= acked) {
                continue;
            }
            rewind = self.reconcile(snapshot, input_tick, latest_tick);
        }
        rewind
    }

    fn pre_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        if info.server_tick.is_none() {
            return self.runner.hold(scene);
        }

        let corrected = self.apply_correction(info, scene)?;
        if info.is_resim && !corrected {
            if self.resync {
                // Replay already aborted; leave the body where the world put it.
                return Ok(());
            }
            if let Some(prev) = self.history.lookup(info.local_tick - 1).cloned() {
                self.runner.apply_state(scene, prev)?;
            }
        }

        let Some(input) = self.inputs.input_for_tick(info.local_tick).cloned() else {
            self.stats.missing_inputs += 1;
            self.resync = true;
            warn!(
                "{:?} has no input for tick {}, waiting for an authority resync",
                self.model_id, info.local_tick
            );
            return Err(SimError::MissingInput { tick: info.local_tick });
        };

        self.runner.pre_tick(info, scene, input)
    }

    fn post_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        let Some(TickResult { snapshot, events }) = self.runner.post_tick(info, scene)? else {
            if info.server_tick.is_none() {
                return self.runner.hold(scene);
            }
            return Ok(());
        };

        for event in events {
            self.events.dispatch(event, info);
        }
        self.history.update(snapshot);

        if info.is_resim {
            self.stats.ticks_replayed += 1;
        } else {
            self.stats.ticks_predicted += 1;
        }
        Ok(())
    }

    fn post_physics(&mut self, frame: &mut FrameContext) {
        let unsent = std::mem::take(&mut self.unsent_inputs);
        if unsent > 0 {
            // Forced ticks can produce more inputs in one frame than the window holds.
            let window = self.inputs.window(unsent.max(self.config.input_sliding_window_size));
            match encode_input_bundle(&window) {
                Ok(bytes) => {
                    self.sink.send(
                        Packet::InputBundle {
                            model: self.model_id,
                            bytes,
                        },
                        Reliability::Unreliable,
                    );
                    self.stats.input_bundles_sent += 1;
                }
                Err(e) => warn!("{:?} failed to encode inputs: {}", self.model_id, e),
            }
        }

        let forced = std::mem::take(&mut self.forced_ticks);
        if forced > 0 {
            debug!("{:?} forcing {} ticks", self.model_id, forced);
            frame.force_simulate(forced);
        }

        // Judged on states received this frame only, and never once finished.
        let received = self.newest_received_input.take();
        let far_ahead = !self.runner.is_finished()
            && frame
                .latest_tick
                .zip(received)
                .is_some_and(|(latest, authority)| latest - authority > self.config.rewind_buffer_ticks());
        self.time_dilation = if far_ahead {
            self.config.authority_catchup_timescale
        } else {
            self.control
                .map_or(1.0, |control| 1.0 + control.time_dilation * self.config.max_time_dilation)
        };
        frame.set_time_dilation(self.time_dilation);

        let model_id = self.model_id;
        let executed = self.events.execute(frame.results_time, None, |record| {
            debug!("{:?} executed {:?} from tick {}", model_id, record.event, record.local_tick);
        });
        self.stats.events_executed += executed as u64;
    }
}
