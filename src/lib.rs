pub mod alerts;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod messaging;
pub mod model;
pub mod notifier;
pub mod orchestrator;
pub mod remote;
pub mod sequencer;
pub mod split;
pub mod storage;
pub mod unpack;
pub mod vendor;
