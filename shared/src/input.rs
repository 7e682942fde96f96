//! Input packets produced once per tick

use crate::tick::Tick;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Domain-specific input payload.
pub trait InputPayload: Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + 'static {}

impl<T> InputPayload for T where T: Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + 'static {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPacket<I> {
    pub tick: Tick,
    pub body: I,
}

impl<I> InputPacket<I> {
    pub fn new(tick: Tick, body: I) -> Self {
        Self { tick, body }
    }
}
