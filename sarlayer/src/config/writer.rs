//! INI serialization logic for converting `ConfigFile` → INI string.
//!
//! Produces the commented representation written by `sarlayer init`.

use std::path::Path;

use super::settings::ConfigFile;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let optional_path = |p: &Option<std::path::PathBuf>| {
        p.as_deref().map(path_to_string).unwrap_or_default()
    };
    let optional_str = |s: &Option<String>| s.clone().unwrap_or_default();
    let workers = config
        .dispatch
        .workers
        .map(|w| w.to_string())
        .unwrap_or_default();

    format!(
        r#"[paths]
; Output root. Holds scene_registry.json, processing_log.json,
; final/ (clipped chips), rtc/ (corrected scenes) and logs/
output_dir = {}
; Directory of input optical chips (*.tif, *.tiff)
chip_dir = {}
; Directory of per-chip label JSON (<chip stem>.json with
; metadata.capture_date; optional metadata.bounds overrides the
; chip's GeoTIFF footprint)
label_dir = {}

[matching]
; Per-coordinate tolerance in degrees for reusing an identical chip (default: 0.01)
coordinate_tolerance = {}
; Maximum days between chip date and scene date for containment reuse (default: 30)
date_tolerance_days = {}
; Buffer in degrees around a scene footprint for containment reuse (default: 0.1)
footprint_buffer = {}
; When true, chips of unknown phase never reuse pre/post scenes (default: false)
strict_phase = {}

[dispatch]
; Number of execution slots (GPUs); at most one correction per slot (default: 2)
slots = {}
; Requests processed concurrently; empty means one per slot
workers = {}
; Search window half-width in days around the chip date (default: 90)
search_days = {}
; Attempts per acquire/ancillary call before the request fails (default: 4)
stage_attempts = {}
; Delay before the first stage retry in milliseconds; doubles per retry (default: 500)
stage_backoff_ms = {}

[registry]
; Attempts per registry update (default: 3)
max_retries = {}
; Delay between attempts in milliseconds (default: 1000)
retry_delay_ms = {}
; Decimal places kept for stored chip bounds (default: 6)
bounds_precision = {}
; Audit final/ against the registry after each run (default: true)
validate_after_run = {}

[raster]
; Output kinds that must be readable rasters with at least one band
raster_kinds = {}

[collaborators]
; External commands for each processing stage. Inputs are passed as
; SARLAYER_* environment variables; each command prints a JSON result.
acquire = {}
ancillary = {}
correction = {}
clip = {}

[logging]
; Default log filter when RUST_LOG is unset (error, warn, info, debug, trace)
level = {}
"#,
        path_to_string(&config.paths.output_dir),
        optional_path(&config.paths.chip_dir),
        optional_path(&config.paths.label_dir),
        config.matching.coordinate_tolerance,
        config.matching.date_tolerance_days,
        config.matching.footprint_buffer,
        config.matching.strict_phase,
        config.dispatch.slots,
        workers,
        config.dispatch.search_days,
        config.dispatch.stage_attempts,
        config.dispatch.stage_backoff_ms,
        config.registry.max_retries,
        config.registry.retry_delay_ms,
        config.registry.bounds_precision,
        config.registry.validate_after_run,
        config.raster.raster_kinds.join(","),
        optional_str(&config.collaborators.acquire),
        optional_str(&config.collaborators.ancillary),
        optional_str(&config.collaborators.correction),
        optional_str(&config.collaborators.clip),
        config.logging.level,
    )
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    #[test]
    fn test_written_config_parses_back() {
        let mut config = ConfigFile::default();
        config.dispatch.slots = 3;
        config.dispatch.stage_attempts = 6;
        config.paths.chip_dir = Some("/chips".into());
        config.collaborators.acquire = Some("fetch-scene".to_string());

        let text = to_config_string(&config);
        let ini = Ini::load_from_str(&text).unwrap();
        let parsed = super::super::parser::parse_ini(&ini).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_contains_every_section() {
        let text = to_config_string(&ConfigFile::default());
        for section in [
            "[paths]",
            "[matching]",
            "[dispatch]",
            "[registry]",
            "[raster]",
            "[collaborators]",
            "[logging]",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
    }
}
