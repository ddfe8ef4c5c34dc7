#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]
//! Multi-year breast cancer risk from the four standard screening mammography views.
//!
//! The model is trained in two stages: a per-view image encoder is pretrained first,
//! then frozen while an attention aggregator, a risk-factor encoder and an additive
//! hazard head are trained adversarially against an acquisition-device discriminator.
//! Raw risk curves are calibrated per horizon with isotonic regression.

pub mod adversary;
pub mod aggregator;
pub mod config;
pub mod encoder;
pub mod hazard;
pub mod logging;
pub mod nn;
pub mod predict;
pub mod risk_factors;
pub mod risk_model;
pub mod snapshot;
pub mod types;

#[path = "../calibrate/mod.rs"]
pub mod calibrate;

#[path = "../data/mod.rs"]
pub mod data;

#[path = "../train/mod.rs"]
pub mod train;
