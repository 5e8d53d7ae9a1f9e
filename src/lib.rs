//! Offline backup engine for game saves.
//!
//! The crate discovers candidate save locations for a registered game by
//! correlating executable metadata against an external catalog, creates
//! versioned content-addressed snapshots of those locations, restores or
//! verifies snapshots against recorded checksums, and can rebuild library
//! state from on-disk snapshots when the index is lost.
//!
//! The desktop shell, IPC surface, file watcher, and session monitor are
//! external collaborators; they drive this crate through [`api::Core`] and
//! the capability traits in [`scan`] and [`api`].

pub mod api;
pub mod library;
pub mod path;
pub mod prelude;
pub mod resource;
pub mod scan;
mod serialization;
pub mod snapshot;

#[cfg(test)]
mod testing;
