//! # Vision Module
//!
//! Everything that looks at camera frames.
//!
//! ## Key Components:
//! - **detector**: the `Detector` capability, the name-routed registry and the call timeout wrapper
//! - **remote**: the HTTP inference-server backend registered for stone, gold and acid
//! - **geometry**: integer boxes and binary masks in frame coordinates
//! - **motion**: distance-history oscillation test and stone box smoothing
//! - **rubbing**: per-session visual rubbing state
//! - **acid**: acid-stage detection and karat reading
//! - **overlay** / **codec**: frame annotation and image encode/decode

pub mod acid;
pub mod codec;
pub mod detector;
pub mod geometry;
pub mod motion;
pub mod overlay;
pub mod remote;
pub mod rubbing;
