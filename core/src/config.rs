use crate::decoder_turbo::TurboDecodeAlgorithm;

/// Default high-pass cutoff applied ahead of the turbo edge detectors.
pub const DEFAULT_HPF_CUTOFF_HZ: f32 = 5327.0;

/// Options for loading a tape image.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadContext {
    /// Edge detector used for the direct (turbo) bit stream of audio input.
    pub turbo_algorithm: TurboDecodeAlgorithm,
    /// Keep 8-bit copies of the decoder input and turbo filter output for
    /// waveform display.
    pub store_waveform: bool,
    /// Turbo pre-filter cutoff; negative selects a fixed 0.9999 coefficient.
    pub hpf_cutoff_hz: f32,
    /// Log the start time of every CAS block under the `tapewave::cas` target.
    pub trace_blocks: bool,
}

impl Default for LoadContext {
    fn default() -> Self {
        Self {
            turbo_algorithm: TurboDecodeAlgorithm::default(),
            store_waveform: false,
            hpf_cutoff_hz: DEFAULT_HPF_CUTOFF_HZ,
            trace_blocks: false,
        }
    }
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turbo_algorithm(mut self, algorithm: TurboDecodeAlgorithm) -> Self {
        self.turbo_algorithm = algorithm;
        self
    }

    pub fn with_store_waveform(mut self, store: bool) -> Self {
        self.store_waveform = store;
        self
    }

    pub fn with_hpf_cutoff(mut self, cutoff_hz: f32) -> Self {
        self.hpf_cutoff_hz = cutoff_hz;
        self
    }

    pub fn with_trace_blocks(mut self, trace: bool) -> Self {
        self.trace_blocks = trace;
        self
    }
}
