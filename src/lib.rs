pub mod synthesizer;

// Re-export commonly used items for convenience
pub use synthesizer::{
    BaseSynthesizer, BoxedSynthesizer, RetryPolicy, SynthResult, SynthesisEvent, SynthesisStream,
    SynthesizerConfig, SynthesizerError, SynthesizerFactory, UtteranceState, create_synthesizer,
};
