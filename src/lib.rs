//! Trucker State Library
//!
//! Authoritative engine for a multiplayer ship-building flight game.
//!
//! # Overview
//!
//! - **Construction** - Players grab face-down components from a shared pool
//!   and weld them onto a grid dashboard. Placement is validated against
//!   connector compatibility and adjacency.
//!
//! - **Resource Ledgers** - Crew, battery and goods totals per ship, kept equal
//!   to the sum over placed components.
//!
//! - **Player Phase Machine** - Every player holds one state that decides which
//!   commands are legal.
//!
//! - **Events** - Mutations emit events collected per command, with aggregate
//!   updates collapsed to their latest value, then routed by visibility.
//!
//! - **Controller** - Session registry, lobby directory and per-match locking.
//!
//! # Design Principles
//!
//! 1. **Check, then act** - A failed command changes nothing and emits nothing.
//!
//! 2. **Explicit context** - Collectors and the controller are plain values
//!    passed around, no globals.
//!
//! 3. **No networking** - Delivery goes through the [`state::Transport`] trait.
//!
//! 4. **Serialization-ready** - Events and snapshots serialize to JSON.

pub mod state;

// Re-export everything from state module at crate root
pub use state::*;
