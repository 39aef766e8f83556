//! Provenance titles for the output file header.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Local};
use cockpit_core::{
    CockpitError, CockpitResult, DeviceDepot, DeviceHandler, DeviceKind, HandlerRef, LightSource,
    TimeMs,
};

pub const MAX_TITLES: usize = 10;
pub const TITLE_LEN: usize = 80;

/// What goes into the titles of one experiment.
pub struct TitleSource<'a> {
    pub when: DateTime<Local>,
    /// Stage position, one entry per axis.
    pub position: &'a [f64],
    pub metadata: &'a str,
    pub handlers: &'a [HandlerRef],
    /// Lights whose filters are listed.
    pub lights: &'a [Arc<dyn LightSource>],
    pub depot: &'a DeviceDepot,
    pub light_exposures: &'a BTreeMap<String, BTreeSet<TimeMs>>,
}

fn chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(TITLE_LEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Describe the stage position, the metadata and every involved handler,
/// grouped by kind.
///
/// Fails with [`CockpitError::TitlesOverflow`] rather than truncating when
/// the result needs more than [`MAX_TITLES`] lines.
pub fn generate_titles(source: &TitleSource<'_>) -> CockpitResult<Vec<String>> {
    let mut groups: Vec<(DeviceKind, Vec<HandlerRef>)> =
        vec![(DeviceKind::LightFilter, Vec::new())];
    let mut add = |handler: HandlerRef| {
        let kind = handler.kind();
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, members)) => {
                if !members.contains(&handler) {
                    members.push(handler);
                }
            }
            None => groups.push((kind, vec![handler])),
        }
    };
    for light in source.lights {
        for filter in source.depot.filters_for(light.name()) {
            add(filter);
        }
    }
    for handler in source.handlers {
        // The stage position is always written in full.
        if handler.kind() != DeviceKind::StagePositioner {
            add(handler.clone());
        }
    }

    let position: Vec<String> = source.position.iter().map(|p| format!("'{p:.2}'")).collect();
    let mut titles = vec![format!(
        "Date & time: {}; pos: [{}]",
        source.when.format("%Y/%m/%d %H:%M:%S"),
        position.join(", ")
    )];
    titles.extend(chunks(source.metadata));

    for (kind, mut handlers) in groups {
        handlers.sort_by(|a, b| a.name().cmp(b.name()));
        let entries: Vec<String> = handlers
            .iter()
            .filter_map(|handler| {
                let mut text = handler.savefile_info().unwrap_or_default();
                if let Some(times) = source.light_exposures.get(handler.name()) {
                    if !times.is_empty() {
                        let times: Vec<String> = times
                            .iter()
                            .map(|t| format!("{:.3}ms", t.as_ms_f64()))
                            .collect();
                        if text.is_empty() {
                            text = handler.name().to_string();
                        }
                        text.push_str(": ");
                        text.push_str(&times.join(","));
                    }
                }
                (!text.is_empty()).then_some(text)
            })
            .collect();
        if !entries.is_empty() {
            titles.extend(chunks(&format!("[{}: {}]", kind.label(), entries.join(";"))));
        }
    }

    if titles.len() > MAX_TITLES {
        return Err(CockpitError::TitlesOverflow {
            count: titles.len(),
            lines: titles.join("\n"),
        });
    }
    Ok(titles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Named {
        name: &'static str,
        kind: DeviceKind,
        info: Option<&'static str>,
        filters: Option<&'static str>,
    }

    #[async_trait]
    impl DeviceHandler for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> DeviceKind {
            self.kind
        }

        fn savefile_info(&self) -> Option<String> {
            self.info.map(str::to_string)
        }

        fn filters_light(&self, light: &str) -> bool {
            self.filters == Some(light)
        }
    }

    struct Laser;

    #[async_trait]
    impl DeviceHandler for Laser {
        fn name(&self) -> &str {
            "488"
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::LightSource
        }

        fn savefile_info(&self) -> Option<String> {
            Some("488 nm".to_string())
        }
    }

    impl LightSource for Laser {
        fn wavelength(&self) -> Option<f64> {
            Some(488.0)
        }
    }

    fn generic(name: &'static str, kind: DeviceKind, info: Option<&'static str>) -> HandlerRef {
        let handler: Arc<dyn DeviceHandler> = Arc::new(Named {
            name,
            kind,
            info,
            filters: None,
        });
        HandlerRef::from(handler)
    }

    fn when() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().unwrap()
    }

    #[test]
    fn small_experiment_fits() {
        let depot = DeviceDepot::new();
        let filter: Arc<dyn DeviceHandler> = Arc::new(Named {
            name: "em filter",
            kind: DeviceKind::LightFilter,
            info: Some("525/50"),
            filters: Some("488"),
        });
        depot.add(filter).unwrap();
        let laser: Arc<dyn LightSource> = Arc::new(Laser);
        let handlers = vec![
            HandlerRef::from(Arc::clone(&laser)),
            generic("cam b", DeviceKind::Camera, Some("512x512")),
            generic("cam a", DeviceKind::Camera, Some("256x256")),
            generic("z", DeviceKind::StagePositioner, Some("12.00 um")),
        ];
        let mut exposures = BTreeMap::new();
        exposures.insert(
            "488".to_string(),
            BTreeSet::from([TimeMs::from_ms(50), TimeMs::parse("7.5").unwrap()]),
        );

        let titles = generate_titles(&TitleSource {
            when: when(),
            position: &[1.0, 2.5, -3.0],
            metadata: "",
            handlers: &handlers,
            lights: std::slice::from_ref(&laser),
            depot: &depot,
            light_exposures: &exposures,
        })
        .unwrap();

        assert_eq!(
            titles,
            vec![
                "Date & time: 2024/03/09 14:05:07; pos: ['1.00', '2.50', '-3.00']".to_string(),
                "[light filter: 525/50]".to_string(),
                "[light source: 488 nm: 7.500ms,50.000ms]".to_string(),
                "[camera: 256x256;512x512]".to_string(),
            ]
        );
    }

    #[test]
    fn long_metadata_is_split_into_full_lines() {
        let depot = DeviceDepot::new();
        let metadata = "m".repeat(170);
        let titles = generate_titles(&TitleSource {
            when: when(),
            position: &[],
            metadata: &metadata,
            handlers: &[],
            lights: &[],
            depot: &depot,
            light_exposures: &BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(titles.len(), 4);
        assert_eq!(titles[1].len(), 80);
        assert_eq!(titles[2].len(), 80);
        assert_eq!(titles[3].len(), 10);
    }

    #[test]
    fn too_much_information_overflows() {
        let depot = DeviceDepot::new();
        let metadata = "x".repeat(80 * 10);
        let err = generate_titles(&TitleSource {
            when: when(),
            position: &[0.0],
            metadata: &metadata,
            handlers: &[],
            lights: &[],
            depot: &depot,
            light_exposures: &BTreeMap::new(),
        })
        .unwrap_err();
        match err {
            CockpitError::TitlesOverflow { count, lines } => {
                assert_eq!(count, 11);
                assert!(lines.starts_with("Date & time"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn handlers_without_info_are_skipped() {
        let depot = DeviceDepot::new();
        let handlers = vec![generic("quiet", DeviceKind::Generic, None)];
        let titles = generate_titles(&TitleSource {
            when: when(),
            position: &[],
            metadata: "",
            handlers: &handlers,
            lights: &[],
            depot: &depot,
            light_exposures: &BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(titles.len(), 1);
    }
}
