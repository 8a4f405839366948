use crate::error::DecodeError;
use audioadapter::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Indexing, Resampler};
use tracing::{debug, trace, warn};

const RESAMPLER_CHUNK_FRAMES: usize = 1024;
const RESAMPLER_SUB_CHUNKS: usize = 2;
const MONO: usize = 1;
const MAX_FLUSH_PASSES: usize = 8;

/// Converts one complete mono buffer from `from_rate` to `to_rate`.
///
/// Each call uses a fresh `rubato::Fft` resampler: full input chunks first,
/// then the zero-padded remainder, then zero passes until the resampler's
/// output delay has been pushed out. The delay is trimmed from the front so
/// the result lines up with the input and has exactly
/// `len * to_rate / from_rate` samples.
pub(crate) fn resample_mono(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, DecodeError> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut resampler = Fft::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLER_CHUNK_FRAMES,
        RESAMPLER_SUB_CHUNKS,
        MONO,
        FixedSync::Input,
    )
    .map_err(|e| DecodeError::Resample(format!("Failed to create Fft resampler: {}", e)))?;

    let expected_len =
        ((samples.len() as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let delay = resampler.output_delay();
    let mut collected = Vec::with_capacity(expected_len + delay);
    let mut output_alloc = vec![vec![0.0f32; resampler.output_frames_max().max(1)]; MONO];

    let mut cursor = 0;
    loop {
        let needed = resampler.input_frames_next();
        if needed == 0 || samples.len() - cursor < needed {
            break;
        }
        let block = vec![samples[cursor..cursor + needed].to_vec()];
        process_block(&mut resampler, &block, needed, None, &mut output_alloc, &mut collected)?;
        cursor += needed;
    }

    let remainder = vec![samples[cursor..].to_vec()];
    let remainder_len = remainder[0].len();
    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        partial_len: Some(remainder_len),
        active_channels_mask: None,
    };
    process_block(
        &mut resampler,
        &remainder,
        remainder_len,
        Some(&indexing),
        &mut output_alloc,
        &mut collected,
    )?;
    trace!(
        "[Resample] {} -> {}Hz: remainder {} frames, {} collected so far",
        from_rate, to_rate, remainder_len, collected.len()
    );

    let empty: Vec<Vec<f32>> = vec![Vec::new()];
    let flush_indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        partial_len: Some(0),
        active_channels_mask: None,
    };
    let mut passes = 0;
    while collected.len() < delay + expected_len && passes < MAX_FLUSH_PASSES {
        let produced = process_block(
            &mut resampler,
            &empty,
            0,
            Some(&flush_indexing),
            &mut output_alloc,
            &mut collected,
        )?;
        passes += 1;
        if produced == 0 {
            debug!("[Resample] Flush pass produced no frames, stopping.");
            break;
        }
    }
    if collected.len() < delay + expected_len {
        warn!(
            "[Resample] Short output: expected {} (+{} delay), got {}. Padding with silence.",
            expected_len,
            delay,
            collected.len()
        );
    }

    collected.drain(..delay.min(collected.len()));
    collected.resize(expected_len, 0.0);
    Ok(collected)
}

#[allow(clippy::ptr_arg)]
fn process_block(
    resampler: &mut Fft<f32>,
    input: &Vec<Vec<f32>>,
    frames: usize,
    indexing: Option<&Indexing>,
    output_alloc: &mut Vec<Vec<f32>>,
    collected: &mut Vec<f32>,
) -> Result<usize, DecodeError> {
    let input_adapter = SequentialSliceOfVecs::new(input, MONO, frames)
        .map_err(|e| DecodeError::Resample(format!("Input adapter error: {}", e)))?;

    let output_frames = resampler.output_frames_next().max(1);
    output_alloc[0].resize(output_frames, 0.0);
    let mut output_adapter = SequentialSliceOfVecs::new_mut(&mut *output_alloc, MONO, output_frames)
        .map_err(|e| DecodeError::Resample(format!("Output adapter error: {}", e)))?;

    let (_frames_read, frames_written) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, indexing)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;

    collected.extend_from_slice(&output_alloc[0][..frames_written]);
    Ok(frames_written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsampling_doubles_length() {
        let input = vec![0.1f32; 2400];
        let output = resample_mono(&input, 24000, 48000).unwrap();
        assert_eq!(output.len(), 4800);
    }

    #[test]
    fn downsampling_preserves_dc_level() {
        let input = vec![0.5f32; 48000];
        let output = resample_mono(&input, 48000, 24000).unwrap();
        assert_eq!(output.len(), 24000);
        let middle = &output[4000..20000];
        let mean = middle.iter().sum::<f32>() / middle.len() as f32;
        assert!((mean - 0.5).abs() < 0.02, "mean level {}", mean);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(resample_mono(&[], 24000, 48000).unwrap().is_empty());
    }
}
