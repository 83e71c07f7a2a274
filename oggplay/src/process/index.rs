use log::trace;

use crate::structs::skeleton::SkeletonInfo;

/// Answers segment length, duration and keypoint queries from a complete
/// index stream.
#[derive(Debug, Clone)]
pub struct IndexReader {
    info: SkeletonInfo,
}

impl IndexReader {
    pub fn new(info: SkeletonInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &SkeletonInfo {
        &self.info
    }

    /// Total segment size in bytes, as recorded by the index header.
    pub fn segment_length(&self) -> Option<u64> {
        self.info.head.segment_length
    }

    /// Latest last-sample time minus earliest first-sample time over the
    /// indexed streams among `serials`.
    pub fn duration(&self, serials: &[u32]) -> Option<f64> {
        let indexes = serials
            .iter()
            .filter_map(|&serial| self.info.index(serial))
            .collect::<Vec<_>>();

        let first = indexes
            .iter()
            .map(|i| i.first_sample_time())
            .min_by(f64::total_cmp)?;
        let last = indexes
            .iter()
            .map(|i| i.last_sample_time())
            .max_by(f64::total_cmp)?;

        Some(last - first)
    }

    /// Byte offset from which decoding of every stream in `serials` can
    /// start and still reach `time` seconds: the earliest of their latest
    /// keypoints at or before `time`.
    pub fn keypoint_offset(&self, serials: &[u32], time: f64) -> Option<u64> {
        let offset = serials
            .iter()
            .filter_map(|&serial| self.info.index(serial))
            .filter_map(|index| index.keypoint_at_or_before(time))
            .map(|keypoint| keypoint.offset)
            .min();

        trace!("Keypoint for {time:.3}s over {serials:X?}: {offset:?}");
        offset
    }

    pub fn keypoint_count(&self, serial: u32) -> usize {
        self.info.index(serial).map_or(0, |i| i.keypoints.len())
    }
}

#[cfg(test)]
fn reader_for_test() -> anyhow::Result<IndexReader> {
    use crate::structs::skeleton::{Fishead, SkeletonIndex};
    use crate::utils::testing::{fishead, skeleton_index};

    let video = skeleton_index(1, 1000, 0, 10_000, &[(1000, 0), (5000, 2000), (9000, 4000)]);
    let audio = skeleton_index(2, 48_000, 960, 480_960, &[(1100, 0), (4800, 96_000)]);

    Ok(IndexReader::new(SkeletonInfo {
        head: Fishead::read(&fishead(20_000, 900))?,
        bones: Vec::new(),
        indexes: vec![SkeletonIndex::read(&video)?, SkeletonIndex::read(&audio)?],
    }))
}

#[test]
fn duration_spans_active_streams() -> anyhow::Result<()> {
    let reader = reader_for_test()?;

    assert_eq!(reader.segment_length(), Some(20_000));
    assert_eq!(reader.duration(&[1]), Some(10.0));
    let both = reader.duration(&[1, 2]).unwrap_or_default();
    assert!((both - 10.02).abs() < 1e-9);
    assert_eq!(reader.duration(&[3]), None);
    Ok(())
}

#[test]
fn keypoints_at_or_before() -> anyhow::Result<()> {
    let reader = reader_for_test()?;

    assert_eq!(reader.keypoint_offset(&[1], 0.0), Some(1000));
    assert_eq!(reader.keypoint_offset(&[1], 3.5), Some(5000));
    assert_eq!(reader.keypoint_offset(&[1], 60.0), Some(9000));
    assert_eq!(reader.keypoint_offset(&[1, 2], 4.5), Some(4800));
    assert_eq!(reader.keypoint_offset(&[1], -0.5), None);
    assert_eq!(reader.keypoint_offset(&[], 1.0), None);
    assert_eq!(reader.keypoint_count(1), 3);
    Ok(())
}
