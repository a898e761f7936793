//! Autosave: turns a continuously edited snapshot into debounced, serialized
//! saves and a status the UI can show.

mod controller;
mod machine;
mod status;

pub use controller::{AutosaveController, AutosaveHandle, Saver};
pub use machine::AutosaveEvent;
pub use status::SaveStatus;
