use crate::error::VideoError;

/// Pick one frame index per temporal segment.
///
/// The video is cut into `num_segments` segments of `(total_frames - 1) / num_segments`
/// frames and the frame closest to the middle of each segment is selected. Offsets are
/// rounded half to even.
///
/// # Arguments
///
/// * `total_frames` - The number of frames in the video.
/// * `num_segments` - The number of frames to sample.
///
/// # Returns
///
/// `num_segments` indices, all strictly smaller than `total_frames`.
///
/// # Examples
///
/// ```
/// use pllava_video::sampling::segment_indices;
///
/// let indices = segment_indices(100, 8).unwrap();
/// assert_eq!(indices, vec![6, 18, 31, 43, 56, 68, 80, 93]);
/// ```
pub fn segment_indices(total_frames: usize, num_segments: usize) -> Result<Vec<usize>, VideoError> {
    if num_segments == 0 {
        return Err(VideoError::InvalidSegments(num_segments));
    }
    if total_frames == 0 {
        return Err(VideoError::NoFrames("empty video".to_string()));
    }

    let seg_size = (total_frames - 1) as f64 / num_segments as f64;
    let start = (seg_size / 2.0) as usize;

    Ok((0..num_segments)
        .map(|idx| start + (seg_size * idx as f64).round_ties_even() as usize)
        .collect())
}

/// Timestamp in seconds of each frame index.
pub fn frame_timestamps(indices: &[usize], fps: f64) -> Vec<f64> {
    indices.iter().map(|&idx| idx as f64 / fps).collect()
}

/// Describe the sampled frames to the language model.
///
/// The message lists the timestamp of every sampled frame with one decimal, e.g.
/// `The video contains 2 frames sampled at 0.5, 1.5 seconds.`
pub fn sampling_message(timestamps: &[f64]) -> String {
    let secs = timestamps
        .iter()
        .map(|t| format!("{t:.1}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "The video contains {} frames sampled at {} seconds.",
        timestamps.len(),
        secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_segment_indices_long_video() -> Result<(), VideoError> {
        // 49.5 rounds to the even neighbour
        let indices = segment_indices(100, 8)?;
        assert_eq!(indices, vec![6, 18, 31, 43, 56, 68, 80, 93]);
        Ok(())
    }

    #[test]
    fn test_segment_indices_short_video() -> Result<(), VideoError> {
        // fewer frames than segments repeats frames but never overflows
        let indices = segment_indices(4, 8)?;
        assert_eq!(indices.len(), 8);
        assert!(indices.iter().all(|&i| i < 4));
        assert_eq!(indices.first(), Some(&0));
        assert_eq!(indices.last(), Some(&3));
        Ok(())
    }

    #[test]
    fn test_segment_indices_single_frame() -> Result<(), VideoError> {
        assert_eq!(segment_indices(1, 3)?, vec![0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_segment_indices_in_bounds() -> Result<(), VideoError> {
        for total in 1..200 {
            for segments in 1..20 {
                let indices = segment_indices(total, segments)?;
                assert_eq!(indices.len(), segments);
                assert!(indices.iter().all(|&i| i < total), "{total} {segments}");
                assert!(indices.windows(2).all(|w| w[0] <= w[1]));
            }
        }
        Ok(())
    }

    #[test]
    fn test_segment_indices_invalid() {
        assert!(matches!(
            segment_indices(10, 0),
            Err(VideoError::InvalidSegments(0))
        ));
        assert!(matches!(segment_indices(0, 4), Err(VideoError::NoFrames(_))));
    }

    #[test]
    fn test_sampling_message() {
        let timestamps = frame_timestamps(&[6, 18, 31], 30.0);
        assert_relative_eq!(timestamps[0], 0.2);
        assert_relative_eq!(timestamps[2], 31.0 / 30.0);
        assert_eq!(
            sampling_message(&timestamps),
            "The video contains 3 frames sampled at 0.2, 0.6, 1.0 seconds."
        );
    }
}
