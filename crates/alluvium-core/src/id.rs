use serde::{Serialize, Deserialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a reach (river segment) in the network.
    pub struct ReachId;

    /// Identifies a junction node between reaches.
    pub struct NodeId;

    /// Identifies a sediment parcel in the store.
    pub struct ParcelId;
}

/// Identifies a user-defined property on a parcel. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyId(pub u16);

/// Labels the provenance of a parcel (tributary, bank collapse, seeding run).
/// Opaque to the engine; callers assign meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceTag(pub u32);
