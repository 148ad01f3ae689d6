//! Pipeline stages for manual-to-instructions conversion.
//!
//! Each submodule implements one transformation step or one shared concern.
//! Stages talk to the outside world only through the collaborator traits
//! ([`render::Rasterizer`], [`detect::RegionDetector`], [`llm::Proposer`],
//! [`llm::Critic`]), so each is testable with in-process doubles.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ detect ──▶ crop ──▶ negotiate
//! (bytes)   (pdfium)   (boxes)   (steps)  (proposer ⇄ critic)
//! ```
//!
//! 1. [`input`]     — resolve a path, URL or buffer to validated PDF bytes
//! 2. [`render`]    — rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`detect`]    — step-panel boxes per page, malformed records discarded
//! 4. [`crop`]      — clamp, filter, order, pad and cut one image per step,
//!    using the box arithmetic in [`geometry`]
//! 5. [`negotiate`] — the bounded draft/critique loop per step, driving the
//!    roles in [`llm`] which send images via [`encode`] and parse replies
//!    with [`response`]

pub mod crop;
pub mod detect;
pub mod encode;
pub mod geometry;
pub mod input;
pub mod llm;
pub mod negotiate;
pub mod render;
pub mod response;
