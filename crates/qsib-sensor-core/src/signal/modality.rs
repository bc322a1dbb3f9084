//! Wire-slot to durable modality mapping
//!
//! Sensors tag every notification with a 4-bit modality type. The type is
//! ephemeral: once a modality is retired (explicitly, or implicitly when the
//! channel layout changes) the same type may start describing a different
//! stream. Each slot is therefore a small state machine mapping the wire type
//! to a durable `u64` modality id that is never reused within a measurement.

use crate::error::{Result, SensorError};
use crate::signal::payload::{Header, MAX_MODALITY_TYPE};

/// Number of on-wire modality slots
pub const SLOT_COUNT: usize = MAX_MODALITY_TYPE as usize + 1;

/// Shape of the values a modality carries
///
/// Only the channel count identifies a modality. Values are widened to `i32`
/// on decode, so the sample width may change between notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub channels: u8,
    pub sample_width: u8,
}

impl From<&Header> for Shape {
    fn from(header: &Header) -> Self {
        Self {
            channels: header.channels,
            sample_width: header.sample_width,
        }
    }
}

/// State of one on-wire slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// No modality has used this type yet
    #[default]
    Unassigned,
    /// The type currently maps to this modality
    Active { id: u64, shape: Shape },
    /// The last modality using this type was retired
    Retired { id: u64 },
}

/// What a payload arrival did to its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Payload appends to an existing active modality
    Existing(u64),
    /// A new modality was allocated for the payload
    Created {
        id: u64,
        /// Modality implicitly retired by a shape change, if any
        rolled_over: Option<u64>,
    },
}

impl Assignment {
    /// Modality the payload belongs to
    pub fn id(&self) -> u64 {
        match *self {
            Assignment::Existing(id) | Assignment::Created { id, .. } => id,
        }
    }
}

impl SlotState {
    /// Transition for an arriving payload of `shape`
    ///
    /// `next_id` is the id a new modality would receive. Returns the new
    /// state and what happened.
    pub fn on_arrival(self, shape: Shape, next_id: u64) -> (SlotState, Assignment) {
        match self {
            SlotState::Active { id, shape: current } if current.channels == shape.channels => {
                (SlotState::Active { id, shape }, Assignment::Existing(id))
            }
            SlotState::Active { id, .. } => (
                SlotState::Active {
                    id: next_id,
                    shape,
                },
                Assignment::Created {
                    id: next_id,
                    rolled_over: Some(id),
                },
            ),
            SlotState::Unassigned | SlotState::Retired { .. } => (
                SlotState::Active {
                    id: next_id,
                    shape,
                },
                Assignment::Created {
                    id: next_id,
                    rolled_over: None,
                },
            ),
        }
    }

    /// Transition for an explicit retirement of `modality_id`
    ///
    /// Returns `None` when this slot does not hold the modality as active.
    pub fn on_retire(self, modality_id: u64) -> Option<SlotState> {
        match self {
            SlotState::Active { id, .. } if id == modality_id => {
                Some(SlotState::Retired { id })
            }
            _ => None,
        }
    }

    /// Active modality id, if any
    pub fn active_id(&self) -> Option<u64> {
        match *self {
            SlotState::Active { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Per-measurement tracker over all wire slots
#[derive(Debug, Clone)]
pub struct ModalityTracker {
    slots: [SlotState; SLOT_COUNT],
    /// Every modality ever allocated, by id: (wire type, retired)
    known: Vec<(u8, bool)>,
}

impl ModalityTracker {
    /// Create a tracker with every slot unassigned
    pub fn new() -> Self {
        Self {
            slots: [SlotState::Unassigned; SLOT_COUNT],
            known: Vec::new(),
        }
    }

    /// Id the next allocated modality will receive (ids start at 1)
    pub fn next_id(&self) -> u64 {
        self.known.len() as u64 + 1
    }

    /// Work out which modality a payload with `header` belongs to
    ///
    /// Pure: the tracker is only updated by [`Self::commit`], so a payload
    /// rejected later in the ingestion path leaves no trace.
    pub fn plan(&self, header: &Header) -> (SlotState, Assignment) {
        let slot = self.slots[usize::from(header.modality_type & MAX_MODALITY_TYPE)];
        slot.on_arrival(Shape::from(header), self.next_id())
    }

    /// Apply a planned transition
    pub fn commit(&mut self, header: &Header, state: SlotState, assignment: Assignment) {
        let slot = usize::from(header.modality_type & MAX_MODALITY_TYPE);
        if let Assignment::Created { rolled_over, .. } = assignment {
            if let Some(old) = rolled_over {
                self.mark_retired(old);
            }
            self.known.push((header.modality_type, false));
        }
        self.slots[slot] = state;
    }

    /// Retire an active modality, freeing its wire type
    pub fn retire(&mut self, measurement: u32, modality_id: u64) -> Result<()> {
        let (wire_type, retired) = self.lookup(modality_id).ok_or(SensorError::UnknownModality {
            measurement,
            modality: modality_id,
        })?;
        if retired {
            return Err(SensorError::AlreadyRetired {
                measurement,
                modality: modality_id,
            });
        }

        let slot = usize::from(wire_type);
        let next = self.slots[slot]
            .on_retire(modality_id)
            .ok_or(SensorError::AlreadyRetired {
                measurement,
                modality: modality_id,
            })?;
        self.slots[slot] = next;
        self.mark_retired(modality_id);
        Ok(())
    }

    /// Wire type and retired flag of a known modality
    pub fn lookup(&self, modality_id: u64) -> Option<(u8, bool)> {
        let index = usize::try_from(modality_id.checked_sub(1)?).ok()?;
        self.known.get(index).copied()
    }

    /// State of the slot for `modality_type`
    pub fn slot(&self, modality_type: u8) -> SlotState {
        self.slots[usize::from(modality_type & MAX_MODALITY_TYPE)]
    }

    fn mark_retired(&mut self, modality_id: u64) {
        if let Some(entry) = modality_id
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.known.get_mut(i))
        {
            entry.1 = true;
        }
    }
}

impl Default for ModalityTracker {
    fn default() -> Self {
        Self::new()
    }
}
