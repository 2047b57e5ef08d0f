//! Core library for the run_daq orchestrator.
//!
//! A run fires a master trigger that paces an image camera, alternates two
//! illumination channels on successive frames, drives an optional stimulation
//! pulse train and behavior camera, and logs an electrode signal. This crate
//! contains the coordination core: the run state machine, the trigger graph,
//! the acquisition workers, the completion barrier and batch sequencing.
//! Devices are reached through the capability traits in
//! [`hardware::capabilities`]; [`hardware::mock`] simulates a complete rig.

pub mod barrier;
pub mod config;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod metadata;
pub mod sequencer;
pub mod timing;
pub mod trigger_graph;
pub mod workers;
