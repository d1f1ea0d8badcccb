//! The training server.
//!
//! [`state`] is the serving/training phase gate, [`service`] the model
//! registry and step executor, [`http`] the control surface the backend
//! client talks to.

pub mod http;
pub mod service;
pub mod state;

pub use http::serve;
pub use service::{
    CommandTuner, ModelStatus, PolicyTuner, RecordingTuner, TrainResult, TrainingService, TuneSpec,
};
pub use state::{InferenceGate, InferencePermit, ServePhase};
