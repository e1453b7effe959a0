use bop_buffer::{OriginId, TupleBuffer};

use crate::config::SequencerConfig;
use crate::error::{WindowError, WindowResult};
use crate::sequencer::WatermarkSequencer;

/// Combines the watermarks of several upstream origins.
///
/// Each origin numbers its buffers independently, so each gets its own
/// [`WatermarkSequencer`]. The operator-wide watermark is the minimum of the
/// per-origin contiguous watermarks: no origin may still deliver a record
/// behind it.
///
/// # Example
///
/// ```rust
/// use bop_buffer::OriginId;
/// use bop_window::MultiOriginWatermarkProcessor;
///
/// let processor =
///     MultiOriginWatermarkProcessor::new(&[OriginId::new(1), OriginId::new(2)]).unwrap();
/// assert_eq!(processor.update_watermark(30, 0, OriginId::new(1)).unwrap(), 0);
/// assert_eq!(processor.update_watermark(20, 0, OriginId::new(2)).unwrap(), 20);
/// ```
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: Vec<OriginId>,
    sequencers: Vec<WatermarkSequencer>,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: &[OriginId]) -> WindowResult<Self> {
        Self::with_config(origins, SequencerConfig::default())
    }

    pub fn with_config(origins: &[OriginId], config: SequencerConfig) -> WindowResult<Self> {
        if origins.is_empty() {
            return Err(WindowError::invalid_config(
                "watermark processor needs at least one origin",
            ));
        }
        for (i, origin) in origins.iter().enumerate() {
            if origins[..i].contains(origin) {
                return Err(WindowError::invalid_config(format!(
                    "origin {origin} listed twice"
                )));
            }
        }
        Ok(Self {
            origins: origins.to_vec(),
            sequencers: origins
                .iter()
                .map(|_| WatermarkSequencer::with_config(config))
                .collect(),
        })
    }

    fn sequencer(&self, origin: OriginId) -> WindowResult<&WatermarkSequencer> {
        self.origins
            .iter()
            .position(|known| *known == origin)
            .map(|index| &self.sequencers[index])
            .ok_or(WindowError::UnknownOrigin(origin))
    }

    /// Records watermark `ts` carried by buffer `seq` of `origin` and returns
    /// the operator-wide watermark.
    pub fn update_watermark(&self, ts: u64, seq: u64, origin: OriginId) -> WindowResult<u64> {
        self.sequencer(origin)?.update(seq, ts);
        Ok(self.current_watermark())
    }

    /// Feeds the watermark, sequence number and origin stamped on `buffer`.
    pub fn update_from_buffer(&self, buffer: &TupleBuffer) -> WindowResult<u64> {
        self.update_watermark(
            buffer.watermark(),
            buffer.sequence_number(),
            buffer.origin_id(),
        )
    }

    pub fn current_watermark(&self) -> u64 {
        self.sequencers
            .iter()
            .map(WatermarkSequencer::current)
            .min()
            .unwrap_or(0)
    }

    pub fn origin_watermark(&self, origin: OriginId) -> WindowResult<u64> {
        Ok(self.sequencer(origin)?.current())
    }

    pub fn origins(&self) -> &[OriginId] {
        &self.origins
    }
}
