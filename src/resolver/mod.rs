mod orchestrator;

pub use orchestrator::{Resolution, ResolutionFailure, ResolutionOrchestrator, UpstreamSettings};
