//! The pipeline coordinator: an ordered, owned sequence of stages with
//! lifecycle management, buffer routing and atomic state restore.

use log::{debug, trace};

use crate::codec::{StateReader, StateWriter, STATE_MAGIC, STATE_VERSION};
use crate::error::{DspError, Result};
use crate::stage::{Stage, StageConfig, StageKind};
use crate::{Float, DEFAULT_SR};

/// Pipeline construction options.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Sample rate handed to every stage at `init`.
    pub sample_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Disposed,
}

/// An ordered pipeline of processing stages.
///
/// Interleaved buffers flow through the stages in insertion order; each
/// stage's output becomes the next stage's input. The pipeline is single-use
/// concurrent: one `process` call at a time, and `dispose` ends its life.
pub struct Pipeline<F: Float> {
    stages: Vec<Box<dyn Stage<F>>>,
    sample_rate: f64,
    state: Lifecycle,
    /// Ping-pong buffers reused across calls.
    front: Vec<F>,
    back: Vec<F>,
}

impl<F: Float> Default for Pipeline<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> Pipeline<F> {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            sample_rate: config.sample_rate,
            state: Lifecycle::Idle,
            front: Vec::new(),
            back: Vec::new(),
        }
    }

    /// Append a stage built from a typed configuration record.
    /// Fluent: returns `self` for chaining.
    pub fn add_stage(&mut self, config: StageConfig<F>) -> Result<&mut Self> {
        self.check_idle()?;
        let stage = config.build()?;
        debug!("pipeline: adding stage {}", stage.kind().name());
        self.stages.push(stage);
        Ok(self)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Change the sample rate for subsequent calls. Stages whose designs
    /// depend on the rate re-resolve (and reset) on the next `process`.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        self.check_idle()?;
        if !(sample_rate > 0.0) {
            return Err(DspError::invalid("sample rate must be positive"));
        }
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// Total output delay in frames across all stages.
    pub fn latency(&self) -> usize {
        self.stages.iter().map(|s| s.latency()).sum()
    }

    pub fn is_disposed(&self) -> bool {
        self.state == Lifecycle::Disposed
    }

    fn check_idle(&self) -> Result<()> {
        match self.state {
            Lifecycle::Idle => Ok(()),
            Lifecycle::Running => Err(DspError::PipelineBusy),
            Lifecycle::Disposed => Err(DspError::PipelineDisposed),
        }
    }

    /// Push interleaved samples through every stage and return the final
    /// interleaved output.
    ///
    /// `channels` is the input channel count; the sample count must be a
    /// multiple of it. `timestamps` optionally holds one millisecond value
    /// per input frame for time-aware stages.
    pub fn process(
        &mut self,
        samples: &[F],
        timestamps: Option<&[f64]>,
        channels: usize,
    ) -> Result<Vec<F>> {
        self.check_idle()?;
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if samples.len() % channels != 0 {
            return Err(DspError::ShapeMismatch(format!(
                "input length {} is not a multiple of {channels} channels",
                samples.len()
            )));
        }
        let frames = samples.len() / channels;
        if let Some(ts) = timestamps {
            if ts.len() != frames {
                return Err(DspError::ShapeMismatch(format!(
                    "{} timestamps for {frames} frames",
                    ts.len()
                )));
            }
        }
        self.state = Lifecycle::Running;
        let result = self.run(samples, timestamps, channels);
        self.state = Lifecycle::Idle;
        result
    }

    fn run(
        &mut self,
        samples: &[F],
        timestamps: Option<&[f64]>,
        mut channels: usize,
    ) -> Result<Vec<F>> {
        self.front.clear();
        self.front.extend_from_slice(samples);
        let mut frames = samples.len() / channels;

        for (index, stage) in self.stages.iter_mut().enumerate() {
            stage.init(channels, self.sample_rate)?;
            // Timestamps only make sense while the frame axis still lines up
            // with the original input.
            let ts = timestamps.filter(|ts| ts.len() == frames);
            self.back.clear();
            stage.process(&self.front, ts, &mut self.back)?;
            core::mem::swap(&mut self.front, &mut self.back);
            channels = stage.output_channels();
            frames = self.front.len() / channels.max(1);
            trace!(
                "pipeline: stage {index} ({}) -> {frames} frames x {channels} channels",
                stage.kind().name()
            );
        }
        Ok(self.front.clone())
    }

    /// Reset every stage to its zero state.
    pub fn clear_state(&mut self) -> Result<()> {
        self.check_idle()?;
        for stage in &mut self.stages {
            stage.reset();
        }
        Ok(())
    }

    /// Serialize the composite state of all stages into one opaque blob.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        self.check_idle()?;
        let mut w = StateWriter::new();
        w.write_u8(STATE_MAGIC[0]);
        w.write_u8(STATE_MAGIC[1]);
        w.write_u8(STATE_MAGIC[2]);
        w.write_u8(STATE_MAGIC[3]);
        w.write_u16(STATE_VERSION);
        w.write_f64(self.sample_rate);
        w.write_u16(self.stages.len() as u16);
        for stage in &self.stages {
            w.write_u8(stage.kind() as u8);
            w.write_u16(stage.version());
            let mut payload = StateWriter::new();
            stage.save_state(&mut payload);
            w.write_bytes(&payload.into_bytes());
        }
        debug!("pipeline: saved state, {} bytes", w.len());
        Ok(w.into_bytes())
    }

    /// Restore a blob produced by `save_state`.
    ///
    /// The restore is transactional: every stage's current state is
    /// snapshotted first, and any per-stage failure rolls all stages back
    /// before the error returns.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_idle()?;
        let mut r = StateReader::new(bytes);

        let magic = [
            r.read_u8()?,
            r.read_u8()?,
            r.read_u8()?,
            r.read_u8()?,
        ];
        if magic != STATE_MAGIC {
            return Err(DspError::StateCorrupted("bad magic tag".into()));
        }
        let version = r.read_u16()?;
        if version != STATE_VERSION {
            return Err(DspError::StateCorrupted(format!(
                "unsupported state version {version}"
            )));
        }
        let saved_rate = r.read_f64()?;
        let count = r.read_u16()? as usize;
        if count != self.stages.len() {
            return Err(DspError::StateMismatch(format!(
                "payload has {count} stages, pipeline has {}",
                self.stages.len()
            )));
        }

        // Parse and validate the full frame before touching any stage.
        let mut payloads: Vec<&[u8]> = Vec::with_capacity(count);
        for stage in self.stages.iter() {
            let kind = StageKind::from_tag(r.read_u8()?)?;
            if kind != stage.kind() {
                return Err(DspError::StateMismatch(format!(
                    "payload stage {} does not match pipeline stage {}",
                    kind.name(),
                    stage.kind().name()
                )));
            }
            let stage_version = r.read_u16()?;
            if stage_version != stage.version() {
                return Err(DspError::StateCorrupted(format!(
                    "unsupported {} stage version {stage_version}",
                    kind.name()
                )));
            }
            payloads.push(r.read_bytes()?);
        }
        r.finish()?;

        // Snapshot for rollback.
        let snapshots: Vec<Vec<u8>> = self
            .stages
            .iter()
            .map(|stage| {
                let mut w = StateWriter::new();
                stage.save_state(&mut w);
                w.into_bytes()
            })
            .collect();

        let mut failure: Option<DspError> = None;
        for (stage, payload) in self.stages.iter_mut().zip(&payloads) {
            let mut reader = StateReader::new(payload);
            let applied = stage
                .load_state(&mut reader, saved_rate)
                .and_then(|()| reader.finish());
            if let Err(e) = applied {
                failure = Some(e);
                break;
            }
        }

        if let Some(error) = failure {
            // Roll every stage back to its snapshot. Snapshots are our own
            // bytes, so re-applying them succeeds.
            for (stage, snapshot) in self.stages.iter_mut().zip(&snapshots) {
                let mut reader = StateReader::new(snapshot);
                if let Err(rollback_error) = stage.load_state(&mut reader, self.sample_rate) {
                    debug!(
                        "pipeline: rollback of {} failed: {rollback_error}",
                        stage.kind().name()
                    );
                }
            }
            return Err(error);
        }
        debug!("pipeline: restored state for {count} stages");
        Ok(())
    }

    /// Free all stages. Idempotent; further operations other than `dispose`
    /// fail with `PipelineDisposed`.
    pub fn dispose(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Running => Err(DspError::PipelineBusy),
            Lifecycle::Disposed => Ok(()),
            Lifecycle::Idle => {
                debug!("pipeline: disposing {} stages", self.stages.len());
                self.stages.clear();
                self.front.clear();
                self.back.clear();
                self.state = Lifecycle::Disposed;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolve::ConvolutionMode;
    use crate::sliding::WindowSpec;
    use crate::stage::Statistic;

    fn moving_average(window: usize) -> StageConfig<f64> {
        StageConfig::MovingStat {
            statistic: Statistic::Mean,
            window: WindowSpec::Count(window),
        }
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let mut p = Pipeline::<f64>::new();
        let out = p.process(&[1.0, 2.0, 3.0, 4.0], None, 2).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut p = Pipeline::<f64>::new();
        assert!(matches!(
            p.process(&[1.0, 2.0, 3.0], None, 2),
            Err(DspError::ShapeMismatch(_))
        ));
        assert!(matches!(
            p.process(&[1.0, 2.0], Some(&[0.0]), 2),
            Ok(_)
        ));
        assert!(matches!(
            p.process(&[1.0, 2.0], Some(&[0.0, 1.0]), 2),
            Err(DspError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_multi_channel_fan() {
        // Nine channels of [2, 4, 6, 8, 10] interleaved through a batch
        // convolution with [0.5, 0.5].
        let channels = 9;
        let per_channel = [2.0f64, 4.0, 6.0, 8.0, 10.0];
        let mut input = Vec::new();
        for &v in &per_channel {
            for _ in 0..channels {
                input.push(v);
            }
        }
        let mut p = Pipeline::<f64>::new();
        p.add_stage(StageConfig::Convolution {
            kernel: vec![0.5, 0.5],
            mode: ConvolutionMode::Batch,
        })
        .unwrap();
        let out = p.process(&input, None, channels).unwrap();
        assert_eq!(out.len(), 36);
        for (t, frame) in out.chunks_exact(channels).enumerate() {
            for &v in frame {
                assert_eq!(v, [3.0, 5.0, 7.0, 9.0][t]);
            }
        }
    }

    #[test]
    fn test_disposal_idempotence() {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(moving_average(4)).unwrap();
        p.dispose().unwrap();
        p.dispose().unwrap();
        p.dispose().unwrap();
        assert!(matches!(
            p.process(&[1.0], None, 1),
            Err(DspError::PipelineDisposed)
        ));
        assert!(matches!(p.clear_state(), Err(DspError::PipelineDisposed)));
        assert!(matches!(p.save_state(), Err(DspError::PipelineDisposed)));
        assert!(matches!(
            p.add_stage(moving_average(2)),
            Err(DspError::PipelineDisposed)
        ));
    }

    #[test]
    fn test_save_load_round_trip_continues_stream() {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(moving_average(3)).unwrap();
        let input: Vec<f64> = (0..10).map(|i| i as f64).collect();
        p.process(&input, None, 1).unwrap();

        let blob = p.save_state().unwrap();
        let mut q = Pipeline::<f64>::new();
        q.add_stage(moving_average(3)).unwrap();
        q.load_state(&blob).unwrap();

        let tail = [100.0f64, 200.0];
        assert_eq!(
            p.process(&tail, None, 1).unwrap(),
            q.process(&tail, None, 1).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_stage_mismatch() {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(moving_average(3)).unwrap();
        p.process(&[1.0, 2.0], None, 1).unwrap();
        let blob = p.save_state().unwrap();

        let mut q = Pipeline::<f64>::new();
        q.add_stage(StageConfig::MovingStat {
            statistic: Statistic::Rms,
            window: WindowSpec::Count(3),
        })
        .unwrap();
        assert!(matches!(
            q.load_state(&blob),
            Err(DspError::StateMismatch(_))
        ));

        let mut r = Pipeline::<f64>::new();
        r.add_stage(moving_average(3)).unwrap();
        r.add_stage(moving_average(3)).unwrap();
        assert!(matches!(
            r.load_state(&blob),
            Err(DspError::StateMismatch(_))
        ));
    }

    #[test]
    fn test_corrupted_state_rolls_back() {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(moving_average(4)).unwrap();
        let input: Vec<f64> = (0..16).map(|i| (i as f64 * 0.31).sin()).collect();
        p.process(&input, None, 1).unwrap();

        let mut reference = Pipeline::<f64>::new();
        reference.add_stage(moving_average(4)).unwrap();
        reference.process(&input, None, 1).unwrap();

        let mut blob = p.save_state().unwrap();
        // Corrupt the magic tag.
        blob[0] = 0x00;
        assert!(matches!(
            p.load_state(&blob),
            Err(DspError::StateCorrupted(_))
        ));

        // The failed load left the pipeline exactly as it was.
        let tail: Vec<f64> = (0..100).map(|i| (i as f64 * 0.07).cos()).collect();
        assert_eq!(
            p.process(&tail, None, 1).unwrap(),
            reference.process(&tail, None, 1).unwrap()
        );
    }

    #[test]
    fn test_truncated_payload_rolls_back() {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(moving_average(4)).unwrap();
        p.process(&[1.0, 2.0, 3.0, 4.0, 5.0], None, 1).unwrap();
        let pre = p.save_state().unwrap();

        // Truncating the blob corrupts the last stage payload.
        let cut = pre.len() - 5;
        assert!(p.load_state(&pre[..cut]).is_err());
        // State is unchanged: saving again reproduces the original bytes.
        assert_eq!(p.save_state().unwrap(), pre);
    }

    #[test]
    fn test_clear_state_equals_fresh_pipeline() {
        let build = || {
            let mut p = Pipeline::<f64>::new();
            p.add_stage(moving_average(3)).unwrap();
            p.add_stage(StageConfig::Iir {
                spec: crate::stage::IirSpec::ButterworthLowpass { cutoff: 2000.0 },
            })
            .unwrap();
            p
        };
        let input: Vec<f64> = (0..50).map(|i| (i as f64 * 0.11).sin()).collect();
        let mut p = build();
        p.process(&input, None, 1).unwrap();
        p.clear_state().unwrap();
        let mut fresh = build();
        assert_eq!(
            p.process(&input, None, 1).unwrap(),
            fresh.process(&input, None, 1).unwrap()
        );
    }
}
