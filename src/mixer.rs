use std::collections::{HashMap, HashSet};

use crate::config::Settings;
use crate::groups::GroupLayout;
use crate::scenes::model::UniversePayload;

/// What the mixer needs to know about the rig. Backed by the active
/// fixture plan in production, trivially faked in tests.
pub trait FixtureMetadata {
    /// `(universe, 1-based channel)` pairs of intensity parameters, or
    /// `None` when no plan is active (raw master mode).
    fn intensity_addresses(&self) -> Option<HashSet<(u16, u16)>>;
    fn groups(&self) -> Vec<GroupLayout>;
}

/// Atmosphere overlay targets, already converted to zero-based
/// `(universe, channel_index)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtmosphereAddresses {
    pub haze: Option<(u16, usize)>,
    pub fog_flash: Option<(u16, usize)>,
}

impl AtmosphereAddresses {
    /// Settings carry 1-based universe/channel; channel 0 disables an
    /// overlay.
    pub fn from_settings(settings: &Settings) -> Self {
        let convert = |universe: u16, channel: u16| {
            (universe >= 1 && channel >= 1).then(|| (universe - 1, (channel - 1) as usize))
        };
        Self {
            haze: convert(settings.haze_universe, settings.haze_channel),
            fog_flash: convert(settings.fog_flash_universe, settings.fog_flash_channel),
        }
    }
}

/// Per-channel percent scaling with the usual DMX rounding.
fn scale(value: u8, percent: u8) -> u8 {
    ((value as f64) * (percent as f64) / 100.0).round().min(255.0) as u8
}

/// Compose the effective payload that actually goes on the wire:
/// master dimmer, then group dimmers (minimum across overlapping groups),
/// then the atmosphere overlays, in that order. An empty base payload
/// yields an empty result, which stops the stream.
pub fn mix(
    base: &UniversePayload,
    master_percent: u8,
    metadata: &dyn FixtureMetadata,
    group_values: &HashMap<String, u8>,
    group_muted: &HashSet<String>,
    haze_percent: u8,
    fog_flash_active: bool,
    atmosphere: &AtmosphereAddresses,
) -> UniversePayload {
    if base.is_empty() {
        return UniversePayload::new();
    }
    let mut effective = base.clone();

    // Master dimmer: parameter-aware when a plan exposes intensity
    // addresses, raw across every channel otherwise.
    let master = master_percent.min(100);
    if master < 100 {
        match metadata.intensity_addresses() {
            Some(addresses) => {
                for (universe, channel) in addresses {
                    if channel == 0 {
                        continue;
                    }
                    if let Some(values) = effective.get_mut(&universe) {
                        let index = channel as usize - 1;
                        if index < values.len() {
                            values[index] = scale(values[index], master);
                        }
                    }
                }
            }
            None => {
                for values in effective.values_mut() {
                    for value in values.iter_mut() {
                        *value = scale(*value, master);
                    }
                }
            }
        }
    }

    // Group dimmers: overlapping groups scale by the minimum effective
    // percent, applied once per touched channel.
    let mut channel_percent: HashMap<(u16, u16), u8> = HashMap::new();
    for group in metadata.groups() {
        let percent = if group_muted.contains(&group.key) {
            0
        } else {
            group_values.get(&group.key).copied().unwrap_or(100).min(100)
        };
        for address in &group.addresses {
            let entry = channel_percent.entry(*address).or_insert(100);
            *entry = (*entry).min(percent);
        }
    }
    for ((universe, channel), percent) in channel_percent {
        if percent >= 100 || channel == 0 {
            continue;
        }
        if let Some(values) = effective.get_mut(&universe) {
            let index = channel as usize - 1;
            if index < values.len() {
                values[index] = scale(values[index], percent);
            }
        }
    }

    // Atmosphere overlays replace the channel value outright; they are
    // not subject to master or group scaling.
    if let Some((universe, index)) = atmosphere.haze {
        if let Some(values) = effective.get_mut(&universe) {
            if index < values.len() {
                values[index] = ((haze_percent.min(100) as f64) * 255.0 / 100.0).round() as u8;
            }
        }
    }
    if let Some((universe, index)) = atmosphere.fog_flash {
        if let Some(values) = effective.get_mut(&universe) {
            if index < values.len() {
                values[index] = if fog_flash_active { 255 } else { 0 };
            }
        }
    }

    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenes::model::DMX_CHANNELS;
    use std::collections::BTreeMap;

    /// Fake plan for mixer tests.
    struct FakeMetadata {
        intensity: Option<HashSet<(u16, u16)>>,
        groups: Vec<GroupLayout>,
    }

    impl FakeMetadata {
        fn none() -> Self {
            Self {
                intensity: None,
                groups: Vec::new(),
            }
        }
    }

    impl FixtureMetadata for FakeMetadata {
        fn intensity_addresses(&self) -> Option<HashSet<(u16, u16)>> {
            self.intensity.clone()
        }
        fn groups(&self) -> Vec<GroupLayout> {
            self.groups.clone()
        }
    }

    fn group(key: &str, addresses: Vec<(u16, u16)>) -> GroupLayout {
        GroupLayout {
            key: key.to_string(),
            name: key.to_string(),
            fixture_count: 1,
            channel_count: addresses.len(),
            addresses,
        }
    }

    fn base(value: u8) -> UniversePayload {
        BTreeMap::from([(0u16, vec![value; DMX_CHANNELS])])
    }

    fn no_atmosphere() -> AtmosphereAddresses {
        AtmosphereAddresses::default()
    }

    #[test]
    fn full_master_without_groups_is_identity() {
        let payload = base(200);
        let mixed = mix(
            &payload,
            100,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            0,
            false,
            &no_atmosphere(),
        );
        assert_eq!(mixed, payload);
    }

    #[test]
    fn raw_master_scales_every_channel() {
        let mixed = mix(
            &base(200),
            50,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            0,
            false,
            &no_atmosphere(),
        );
        assert!(mixed[&0].iter().all(|&v| v == 100));
    }

    #[test]
    fn parameter_aware_master_scales_only_intensity_addresses() {
        let metadata = FakeMetadata {
            intensity: Some(HashSet::from([(0u16, 1u16), (0u16, 3u16)])),
            groups: Vec::new(),
        };
        let mixed = mix(
            &base(200),
            50,
            &metadata,
            &HashMap::new(),
            &HashSet::new(),
            0,
            false,
            &no_atmosphere(),
        );
        assert_eq!(mixed[&0][0], 100); // channel 1
        assert_eq!(mixed[&0][1], 200); // untouched
        assert_eq!(mixed[&0][2], 100); // channel 3
        assert_eq!(mixed[&0][3], 200);
    }

    #[test]
    fn overlapping_groups_take_the_minimum() {
        let metadata = FakeMetadata {
            intensity: None,
            groups: vec![
                group("g1", vec![(0, 1), (0, 2)]),
                group("g2", vec![(0, 2), (0, 3)]),
            ],
        };
        let values = HashMap::from([("g1".to_string(), 60u8), ("g2".to_string(), 20u8)]);
        let mixed = mix(
            &base(200),
            100,
            &metadata,
            &values,
            &HashSet::new(),
            0,
            false,
            &no_atmosphere(),
        );
        assert_eq!(mixed[&0][0], 120); // only g1
        assert_eq!(mixed[&0][1], 40); // min(60, 20)
        assert_eq!(mixed[&0][2], 40); // only g2
        assert!(mixed[&0][3..].iter().all(|&v| v == 200));
    }

    #[test]
    fn muted_group_forces_zero() {
        let metadata = FakeMetadata {
            intensity: None,
            groups: vec![group("g1", vec![(0, 1)])],
        };
        let values = HashMap::from([("g1".to_string(), 80u8)]);
        let muted = HashSet::from(["g1".to_string()]);
        let mixed = mix(
            &base(200),
            100,
            &metadata,
            &values,
            &muted,
            0,
            false,
            &no_atmosphere(),
        );
        assert_eq!(mixed[&0][0], 0);
    }

    #[test]
    fn atmosphere_overlays_replace_after_scaling() {
        let atmosphere = AtmosphereAddresses {
            haze: Some((0, 9)),
            fog_flash: Some((0, 10)),
        };
        let mixed = mix(
            &base(200),
            10,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            40,
            true,
            &atmosphere,
        );
        // Scaled channel for reference.
        assert_eq!(mixed[&0][0], 20);
        // Haze 40% -> 102, fog flash -> 255, neither scaled by master.
        assert_eq!(mixed[&0][9], 102);
        assert_eq!(mixed[&0][10], 255);

        let off = mix(
            &base(200),
            100,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            0,
            false,
            &atmosphere,
        );
        assert_eq!(off[&0][9], 0);
        assert_eq!(off[&0][10], 0);
    }

    #[test]
    fn atmosphere_never_creates_a_universe() {
        let atmosphere = AtmosphereAddresses {
            haze: Some((5, 0)),
            fog_flash: None,
        };
        let mixed = mix(
            &base(10),
            100,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            100,
            false,
            &atmosphere,
        );
        assert!(!mixed.contains_key(&5));
    }

    #[test]
    fn empty_base_yields_empty_effective() {
        let mixed = mix(
            &UniversePayload::new(),
            50,
            &FakeMetadata::none(),
            &HashMap::new(),
            &HashSet::new(),
            100,
            true,
            &no_atmosphere(),
        );
        assert!(mixed.is_empty());
    }

    #[test]
    fn scaling_is_bounded_and_monotone() {
        for value in [0u8, 1, 127, 200, 255] {
            let mut previous = 0u8;
            for percent in 0..=100u8 {
                let scaled = scale(value, percent);
                assert!(scaled <= value);
                assert!(scaled >= previous);
                previous = scaled;
            }
            assert_eq!(scale(value, 100), value);
            assert_eq!(scale(value, 0), 0);
        }
    }

    #[test]
    fn settings_conversion_respects_disable_channel() {
        let mut settings = Settings::default();
        settings.haze_universe = 1;
        settings.haze_channel = 0; // disabled
        settings.fog_flash_universe = 2;
        settings.fog_flash_channel = 7;
        let atmosphere = AtmosphereAddresses::from_settings(&settings);
        assert!(atmosphere.haze.is_none());
        assert_eq!(atmosphere.fog_flash, Some((1, 6)));
    }
}
