use distil_core::bus::BusEventDef;

/// Progress events published while a compaction attempt runs. Advisory only;
/// dropped receivers never affect correctness.
pub static TRIGGERED: BusEventDef = BusEventDef::new("compaction.triggered");
pub static CATEGORIZING: BusEventDef = BusEventDef::new("compaction.categorizing");
pub static CHUNK: BusEventDef = BusEventDef::new("compaction.chunk");
pub static COMPLETED: BusEventDef = BusEventDef::new("compaction.completed");
pub static WARNING: BusEventDef = BusEventDef::new("compaction.warning");
pub static ERROR: BusEventDef = BusEventDef::new("compaction.error");
