//! Time-indexed parcel storage.
//!
//! The store keeps one [`ParcelRecord`] per parcel per recorded step, laid
//! out as a column per step (`SecondaryMap` keyed by parcel). A parcel born
//! at step 20 simply has no entry in earlier columns, so histories of mixed
//! birth times stay index-aligned without backfill.
//!
//! Mutation discipline: only the most recent column is ever written. The
//! engine stages a new column with [`ParcelStore::append_timestep`], edits
//! it in place, and on fatal error discards exactly that column, leaving the
//! prior step as the last valid state.

use crate::id::{ParcelId, ReachId};
use crate::parcel::{ArrivalKey, Location, ParcelAttributes, ParcelRecord, ParcelSpec};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timestep {requested} outside recorded history {base}..={latest}")]
    OutOfRange { requested: u64, base: u64, latest: u64 },
    #[error("parcel not found: {0:?}")]
    UnknownParcel(ParcelId),
    #[error("parcels can only be added at the latest step {latest}, got {requested}")]
    NotLatestStep { requested: u64, latest: u64 },
    #[error("parcel spec {index} rejected: {reason}")]
    InvalidSpec { index: usize, reason: &'static str },
    #[error("relocate position {0} outside [0, 1]")]
    InvalidPosition(f64),
}

// ---------------------------------------------------------------------------
// Snapshots returned by queries
// ---------------------------------------------------------------------------

/// One parcel's position at a queried step. Owned copy, no borrow into the
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParcelPosition {
    pub parcel: ParcelId,
    pub location: Location,
    pub position: f64,
    pub in_active_layer: bool,
}

/// One column of history: every live parcel's record at one step.
pub(crate) type TimeSlice = SecondaryMap<ParcelId, ParcelRecord>;

// ---------------------------------------------------------------------------
// ParcelStore
// ---------------------------------------------------------------------------

/// The parcel store. See module docs for the layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelStore {
    attrs: SlotMap<ParcelId, ParcelAttributes>,
    /// `history[i]` is the state at absolute step `base_step + i`.
    /// Never empty.
    history: Vec<TimeSlice>,
    /// Absolute step index of `history[0]`. Non-zero after truncation.
    base_step: u64,
    /// Issued on every arrival event; total-orders same-step arrivals.
    next_arrival_seq: u64,
    /// Parcel creation order, for deterministic iteration.
    parcel_order: Vec<ParcelId>,
}

impl ParcelStore {
    /// Empty store with a single recorded step 0.
    pub fn new() -> Self {
        Self {
            attrs: SlotMap::with_key(),
            history: vec![SecondaryMap::new()],
            base_step: 0,
            next_arrival_seq: 0,
            parcel_order: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // History shape
    // -----------------------------------------------------------------------

    /// Absolute step index of the most recent column.
    pub fn latest_step(&self) -> u64 {
        self.base_step + (self.history.len() as u64 - 1)
    }

    /// Absolute step index of the oldest retained column.
    pub fn base_step(&self) -> u64 {
        self.base_step
    }

    /// Number of retained columns.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn parcel_count(&self) -> usize {
        self.parcel_order.len()
    }

    /// Parcels in creation order.
    pub fn parcel_ids(&self) -> impl Iterator<Item = ParcelId> + '_ {
        self.parcel_order.iter().copied()
    }

    /// Creation-order slice, shared with the engine's iteration.
    pub(crate) fn parcel_order(&self) -> &[ParcelId] {
        &self.parcel_order
    }

    fn slice_index(&self, step: u64) -> Result<usize, StoreError> {
        let latest = self.latest_step();
        if step < self.base_step || step > latest {
            return Err(StoreError::OutOfRange {
                requested: step,
                base: self.base_step,
                latest,
            });
        }
        Ok((step - self.base_step) as usize)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Every parcel's position at an absolute step, in creation order.
    /// Parcels not yet born at that step are absent.
    pub fn positions_at(&self, step: u64) -> Result<Vec<ParcelPosition>, StoreError> {
        let idx = self.slice_index(step)?;
        let slice = &self.history[idx];
        Ok(self
            .parcel_order
            .iter()
            .filter_map(|&pid| {
                slice.get(pid).map(|rec| ParcelPosition {
                    parcel: pid,
                    location: rec.location,
                    position: rec.position,
                    in_active_layer: rec.in_active_layer,
                })
            })
            .collect())
    }

    /// A parcel's record at an absolute step. `Ok(None)` if the parcel was
    /// not yet born at that step.
    pub fn record(&self, parcel: ParcelId, step: u64) -> Result<Option<&ParcelRecord>, StoreError> {
        if !self.attrs.contains_key(parcel) {
            return Err(StoreError::UnknownParcel(parcel));
        }
        let idx = self.slice_index(step)?;
        Ok(self.history[idx].get(parcel))
    }

    /// A parcel's record at the latest step.
    pub fn latest_record(&self, parcel: ParcelId) -> Result<&ParcelRecord, StoreError> {
        self.latest_slice()
            .get(parcel)
            .ok_or(StoreError::UnknownParcel(parcel))
    }

    /// A parcel's fixed attributes.
    pub fn attributes(&self, parcel: ParcelId) -> Result<&ParcelAttributes, StoreError> {
        self.attrs.get(parcel).ok_or(StoreError::UnknownParcel(parcel))
    }

    /// Attribute access for engine internals, where the id is known live.
    pub(crate) fn attr(&self, parcel: ParcelId) -> &ParcelAttributes {
        &self.attrs[parcel]
    }

    pub(crate) fn latest_slice(&self) -> &TimeSlice {
        // Invariant: history is never empty.
        self.history.last().unwrap()
    }

    pub(crate) fn latest_slice_mut(&mut self) -> &mut TimeSlice {
        self.history.last_mut().unwrap()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Stage a new column by copying the latest one. Returns the new
    /// absolute step index.
    pub fn append_timestep(&mut self) -> u64 {
        let staged = self.latest_slice().clone();
        self.history.push(staged);
        self.latest_step()
    }

    /// Drop the staged (latest) column after a failed step. Keeps at least
    /// one column.
    pub(crate) fn discard_staged(&mut self) {
        if self.history.len() > 1 {
            self.history.pop();
        }
    }

    /// Issue the next arrival key for an arrival event at `step`.
    pub(crate) fn issue_arrival(&mut self, step: u64) -> ArrivalKey {
        let key = ArrivalKey {
            step,
            seq: self.next_arrival_seq,
        };
        self.next_arrival_seq += 1;
        key
    }

    /// Add new parcels at the latest step. All specs are validated before
    /// any is inserted; on error nothing is added.
    ///
    /// `at_step` must equal [`latest_step`](Self::latest_step): earlier
    /// columns are immutable, and absence there already marks pre-birth.
    pub fn add_parcels(
        &mut self,
        specs: &[ParcelSpec],
        at_step: u64,
    ) -> Result<Vec<ParcelId>, StoreError> {
        let latest = self.latest_step();
        if at_step != latest {
            return Err(StoreError::NotLatestStep {
                requested: at_step,
                latest,
            });
        }
        for (index, spec) in specs.iter().enumerate() {
            spec.validate()
                .map_err(|reason| StoreError::InvalidSpec { index, reason })?;
        }

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let pid = self.attrs.insert(ParcelAttributes {
                grain_size: spec.grain_size,
                density: spec.density,
                abrasion_rate: spec.abrasion_rate,
                source: spec.source,
                origin_reach: spec.reach,
                birth_step: at_step,
                properties: spec.properties.clone(),
            });
            self.parcel_order.push(pid);
            let arrival = self.issue_arrival(at_step);
            let slice = self.history.last_mut().unwrap();
            slice.insert(
                pid,
                ParcelRecord {
                    location: Location::InReach(spec.reach),
                    position: spec.position,
                    volume: spec.volume,
                    in_active_layer: false,
                    arrival,
                    distance_total: 0.0,
                    stress_ratio: 0.0,
                },
            );
            ids.push(pid);
        }
        Ok(ids)
    }

    /// Move parcels to a reach/position in the latest column only, issuing
    /// fresh arrival keys at `arrival_step`. Used between steps for pulse
    /// injection and recycling. All ids are checked before any is moved.
    pub fn relocate(
        &mut self,
        parcels: &[ParcelId],
        new_reach: ReachId,
        new_position: f64,
        arrival_step: u64,
    ) -> Result<(), StoreError> {
        if !(new_position >= 0.0 && new_position <= 1.0) {
            return Err(StoreError::InvalidPosition(new_position));
        }
        for &pid in parcels {
            if !self.latest_slice().contains_key(pid) {
                return Err(StoreError::UnknownParcel(pid));
            }
        }
        for &pid in parcels {
            let arrival = self.issue_arrival(arrival_step);
            let rec = self.history.last_mut().unwrap().get_mut(pid).unwrap();
            rec.location = Location::InReach(new_reach);
            rec.position = new_position;
            rec.arrival = arrival;
        }
        Ok(())
    }

    /// Drop all but the most recent `keep_last` columns. The base step
    /// advances so absolute indices keep working; queries below it return
    /// [`StoreError::OutOfRange`]. Callers snapshot first if they need the
    /// old columns.
    pub fn truncate_history(&mut self, keep_last: usize) {
        let keep = keep_last.max(1).min(self.history.len());
        let drop_count = self.history.len() - keep;
        if drop_count > 0 {
            self.history.drain(..drop_count);
            self.base_step += drop_count as u64;
        }
    }
}

impl Default for ParcelStore {
    fn default() -> Self {
        Self::new()
    }
}
