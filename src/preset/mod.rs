//! Presets: saved replication setups of a whole session.
//!
//! A preset records which objects and properties every client replicates, which objects it
//! owns and the session's mute state. Applying a preset replaces the content of all matched
//! clients in one put-state request.

pub mod format;
pub mod manager;
pub mod remap;

pub use format::{
    LabelObjectPath, MultiUserSessionPreset, PresetClient, PresetMuteEntry, PresetObject,
};
pub use manager::{ApplyPresetFlags, PresetManager, preset_objects};
pub use remap::{SceneResolver, StaticScene, remap_to_world, to_label_path};
