//! DSP — the pitch/crunch/volume effect chain and the two ways to run it.
//!
//! The same chain code drives the live preview (pulled block by block by an
//! output device) and the offline renderer (run to completion in one call),
//! so a saved sound is exactly what the preview played.

pub mod chain;
pub mod curve;
pub mod preview;
pub mod renderer;
