//! RKServe Engine
//!
//! Adapter between the HTTP gateway and the RKLLM runtime. Generations run on
//! a blocking thread and stream fragments back through a session; a
//! single-slot gate keeps the runtime to one generation at a time.

pub mod engine;
pub mod ffi;
pub mod gate;
pub mod input;
pub mod native;
pub mod scripted;
pub mod session;

pub use engine::{GenerationBackend, GenerationEngine};
pub use gate::{AdmissionGate, AdmissionSlot};
pub use input::EngineInput;
pub use native::{pin_frequency, NativeBackend};
pub use scripted::ScriptedBackend;
pub use session::{
    FragmentSink, GenerationEvent, GenerationOutput, GenerationSession, SessionId, SessionStatus,
};
