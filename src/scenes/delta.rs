use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::scenes::model::{AnimatedFrame, UniversePayload, DMX_CHANNELS};

pub const ENCODING: &str = "delta-v1";

/// On-disk form of a dynamic frame sequence: the full first frame plus
/// per-frame channel diffs. The format is stable; any change requires an
/// `encoding` bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactFrames {
    pub encoding: String,
    pub initial: UniversePayload,
    pub frames: Vec<CompactFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactFrame {
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<BTreeMap<u16, Vec<(u16, u8)>>>,
}

/// Delta-encode a normalized frame sequence. The first frame becomes
/// `initial`; every later frame stores only the channels that differ from
/// the previous reconstructed state, sorted by channel index.
pub fn encode(frames: &[AnimatedFrame]) -> Result<CompactFrames, ControllerError> {
    let Some(first) = frames.first() else {
        return Err(ControllerError::Invariant(
            "cannot delta-encode an empty frame sequence".to_string(),
        ));
    };

    let mut state = first.universes.clone();
    let mut compact = Vec::with_capacity(frames.len().saturating_sub(1));

    for frame in &frames[1..] {
        let mut changes: BTreeMap<u16, Vec<(u16, u8)>> = BTreeMap::new();
        for (universe, values) in &frame.universes {
            let previous = state.get(universe).ok_or_else(|| {
                ControllerError::Invariant(format!(
                    "frame at {} ms introduces universe {universe}",
                    frame.timestamp_ms
                ))
            })?;
            let diff: Vec<(u16, u8)> = values
                .iter()
                .zip(previous.iter())
                .enumerate()
                .filter(|(_, (new, old))| new != old)
                .map(|(channel, (new, _))| (channel as u16, *new))
                .collect();
            if !diff.is_empty() {
                changes.insert(*universe, diff);
            }
        }
        compact.push(CompactFrame {
            timestamp_ms: frame.timestamp_ms,
            changes: (!changes.is_empty()).then_some(changes),
        });
        state = frame.universes.clone();
    }

    Ok(CompactFrames {
        encoding: ENCODING.to_string(),
        initial: first.universes.clone(),
        frames: compact,
    })
}

/// Reconstruct the full frame sequence by accumulating diffs onto the
/// initial state.
pub fn decode(compact: &CompactFrames) -> Result<Vec<AnimatedFrame>, ControllerError> {
    if compact.encoding != ENCODING {
        return Err(ControllerError::Invariant(format!(
            "unsupported frame encoding {:?}",
            compact.encoding
        )));
    }

    let mut state = compact.initial.clone();
    let mut frames = vec![AnimatedFrame {
        timestamp_ms: 0,
        universes: state.clone(),
    }];

    for frame in &compact.frames {
        if let Some(changes) = &frame.changes {
            for (universe, diff) in changes {
                let values = state.get_mut(universe).ok_or_else(|| {
                    ControllerError::Invariant(format!(
                        "delta frame at {} ms references unknown universe {universe}",
                        frame.timestamp_ms
                    ))
                })?;
                for (channel, value) in diff {
                    let index = *channel as usize;
                    if index >= DMX_CHANNELS {
                        return Err(ControllerError::Invariant(format!(
                            "delta frame at {} ms references channel {channel}",
                            frame.timestamp_ms
                        )));
                    }
                    values[index] = *value;
                }
            }
        }
        frames.push(AnimatedFrame {
            timestamp_ms: frame.timestamp_ms,
            universes: state.clone(),
        });
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(timestamp_ms: u64, edits: &[(u16, usize, u8)]) -> AnimatedFrame {
        let mut universes = UniversePayload::new();
        universes.insert(0, vec![0u8; DMX_CHANNELS]);
        universes.insert(1, vec![0u8; DMX_CHANNELS]);
        for (universe, channel, value) in edits {
            universes.get_mut(universe).unwrap()[*channel] = *value;
        }
        AnimatedFrame {
            timestamp_ms,
            universes,
        }
    }

    #[test]
    fn round_trip_preserves_frames() {
        let frames = vec![
            frame(0, &[(0, 0, 255), (1, 10, 40)]),
            frame(250, &[(0, 0, 255), (0, 1, 128), (1, 10, 40)]),
            frame(500, &[(0, 0, 0), (1, 10, 41)]),
            frame(1000, &[(0, 0, 0), (1, 10, 41)]),
        ];
        let compact = encode(&frames).unwrap();
        assert_eq!(decode(&compact).unwrap(), frames);
    }

    #[test]
    fn unchanged_frames_carry_no_changes() {
        let frames = vec![
            frame(0, &[(0, 5, 100)]),
            frame(400, &[(0, 5, 100)]),
            frame(800, &[(0, 5, 100)]),
        ];
        let compact = encode(&frames).unwrap();
        assert_eq!(compact.frames.len(), 2);
        assert!(compact.frames.iter().all(|f| f.changes.is_none()));
    }

    #[test]
    fn changes_list_only_touched_channels() {
        let frames = vec![
            frame(0, &[]),
            frame(100, &[(0, 3, 9), (0, 7, 11)]),
        ];
        let compact = encode(&frames).unwrap();
        let changes = compact.frames[0].changes.as_ref().unwrap();
        assert_eq!(changes[&0], vec![(3u16, 9u8), (7u16, 11u8)]);
        assert!(!changes.contains_key(&1));
    }

    #[test]
    fn empty_sequence_is_rejected() {
        assert!(encode(&[]).is_err());
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let compact = CompactFrames {
            encoding: "delta-v2".to_string(),
            initial: UniversePayload::new(),
            frames: Vec::new(),
        };
        assert!(decode(&compact).is_err());
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        let compact = CompactFrames {
            encoding: ENCODING.to_string(),
            initial: UniversePayload::from([(0u16, vec![0u8; DMX_CHANNELS])]),
            frames: vec![CompactFrame {
                timestamp_ms: 100,
                changes: Some(BTreeMap::from([(0u16, vec![(512u16, 1u8)])])),
            }],
        };
        assert!(decode(&compact).is_err());
    }

    #[test]
    fn compact_form_serializes_change_pairs_as_arrays() {
        let frames = vec![frame(0, &[]), frame(100, &[(0, 2, 30)])];
        let compact = encode(&frames).unwrap();
        let value = serde_json::to_value(&compact).unwrap();
        assert_eq!(value["encoding"], "delta-v1");
        assert_eq!(value["frames"][0]["changes"]["0"][0], serde_json::json!([2, 30]));
    }
}
