//! Client side of the proximity socket.
//!
//! * [`RequestCorrelator`] matches ACKs to the requests that caused them
//! * [`player::Player`] and [`player::PlayerDelegate`] model peers and their
//!   distance-based volume
//! * [`scene::Scene`] applies server events to the set of known peers

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod correlator;

pub use correlator::*;

pub mod player;
pub mod scene;
