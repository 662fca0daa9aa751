use crate::limits::MAX_INTERVALS_PER_DAY;
use crate::model::{parse_time_of_day, Span, TimeRangeInput};

use super::EngineError;

/// Parse, order and validate one day's submitted availability.
///
/// Touching ranges (`end == next.start`) are accepted and kept as separate
/// intervals. An empty submission is valid and means "no availability".
pub fn normalize(ranges: &[TimeRangeInput]) -> Result<Vec<Span>, EngineError> {
    if ranges.len() > MAX_INTERVALS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many intervals submitted for one day"));
    }

    let mut spans = Vec::with_capacity(ranges.len());
    for range in ranges {
        let start = parse_time_of_day(&range.start)
            .ok_or_else(|| EngineError::MalformedTime(range.start.clone()))?;
        let end = parse_time_of_day(&range.end)
            .ok_or_else(|| EngineError::MalformedTime(range.end.clone()))?;
        let span = Span::checked(start, end)
            .ok_or_else(|| EngineError::InvalidRange(range.start.clone(), range.end.clone()))?;
        spans.push(span);
    }

    spans.sort_by_key(|s| s.start);
    for pair in spans.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(EngineError::Overlap {
                first: pair[0],
                second: pair[1],
            });
        }
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorKind;
    use crate::model::tests::span;

    fn input(pairs: &[(&str, &str)]) -> Vec<TimeRangeInput> {
        pairs.iter().map(|(s, e)| TimeRangeInput::new(*s, *e)).collect()
    }

    #[test]
    fn sorts_by_start() {
        let out = normalize(&input(&[("13:00", "17:00"), ("09:00", "12:00")])).unwrap();
        assert_eq!(out, vec![span("09:00", "12:00"), span("13:00", "17:00")]);
    }

    #[test]
    fn empty_is_valid() {
        assert!(normalize(&[]).unwrap().is_empty());
    }

    #[test]
    fn touching_ranges_stay_separate() {
        let out = normalize(&input(&[("10:00", "11:00"), ("09:00", "10:00")])).unwrap();
        assert_eq!(out, vec![span("09:00", "10:00"), span("10:00", "11:00")]);
    }

    #[test]
    fn rejects_overlap_after_sorting() {
        let err = normalize(&input(&[("11:00", "13:00"), ("09:00", "11:30")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overlap);
        match err {
            EngineError::Overlap { first, second } => {
                assert_eq!(first, span("09:00", "11:30"));
                assert_eq!(second, span("11:00", "13:00"));
            }
            other => panic!("expected Overlap, got {other:?}"),
        }
    }

    #[test]
    fn rejects_nested_range() {
        let err = normalize(&input(&[("09:00", "17:00"), ("10:00", "11:00")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overlap);
    }

    #[test]
    fn rejects_malformed_time() {
        for bad in ["9:00am", "25:00", "12:60", "", "noon"] {
            let err = normalize(&input(&[("09:00", "10:00"), (bad, "18:00")])).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedTime, "input {bad:?}");
        }
    }

    #[test]
    fn rejects_empty_or_inverted_range() {
        let err = normalize(&input(&[("10:00", "10:00")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
        let err = normalize(&input(&[("12:00", "08:00")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn malformed_wins_over_later_overlap() {
        // Parsing happens before ordering checks.
        let err = normalize(&input(&[("09:00", "12:00"), ("10:00", "xx")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedTime);
    }

    #[test]
    fn too_many_ranges_is_limit() {
        let many: Vec<TimeRangeInput> = (0..=MAX_INTERVALS_PER_DAY)
            .map(|_| TimeRangeInput::new("09:00", "10:00"))
            .collect();
        let err = normalize(&many).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    }
}
