// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tuning options for a per-connection processor.

/// Default cap on a frame's remaining length.
const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024;

/// All the settings governing a per-connection processor.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ProcessorOptions {
    /// Max remaining length of a received packet
    #[builder(default = "DEFAULT_MAX_PACKET_SIZE")]
    pub(crate) max_packet_size: usize,
    /// Process packets already buffered when the stop signal arrives,
    /// instead of exiting immediately
    #[builder(default = "false")]
    pub(crate) drain_on_cancel: bool,
    /// Capacity reserved ahead of each transport read
    #[builder(default = "4096")]
    pub(crate) read_chunk_size: usize,
}

impl ProcessorOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.max_packet_size {
            return Err("max_packet_size must be greater than zero".to_string());
        }
        if let Some(0) = self.read_chunk_size {
            return Err("read_chunk_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            drain_on_cancel: false,
            read_chunk_size: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default() {
        let built = ProcessorOptionsBuilder::default().build().unwrap();
        let default = ProcessorOptions::default();
        assert_eq!(built.max_packet_size, default.max_packet_size);
        assert_eq!(built.drain_on_cancel, default.drain_on_cancel);
        assert_eq!(built.read_chunk_size, default.read_chunk_size);
    }

    #[test]
    fn zero_packet_size_is_rejected() {
        assert!(ProcessorOptionsBuilder::default()
            .max_packet_size(0usize)
            .build()
            .is_err());
    }

    #[test]
    fn overrides_are_applied() {
        let options = ProcessorOptionsBuilder::default()
            .max_packet_size(256usize)
            .drain_on_cancel(true)
            .build()
            .unwrap();
        assert_eq!(options.max_packet_size, 256);
        assert!(options.drain_on_cancel);
    }
}
