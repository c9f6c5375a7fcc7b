//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};

use super::file::ConfigFileError;
use super::settings::ConfigFile;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [paths] section
    if let Some(section) = ini.section(Some("paths")) {
        if let Some(v) = non_empty(section, "output_dir") {
            config.paths.output_dir = expand_tilde(v);
        }
        config.paths.chip_dir = non_empty(section, "chip_dir").map(expand_tilde);
        config.paths.label_dir = non_empty(section, "label_dir").map(expand_tilde);
    }

    // [matching] section
    if let Some(section) = ini.section(Some("matching")) {
        if let Some(v) = section.get("coordinate_tolerance") {
            config.matching.coordinate_tolerance =
                parse_number("matching", "coordinate_tolerance", v, "must be a number of degrees")?;
        }
        if let Some(v) = section.get("date_tolerance_days") {
            config.matching.date_tolerance_days =
                parse_number("matching", "date_tolerance_days", v, "must be a whole number of days")?;
        }
        if let Some(v) = section.get("footprint_buffer") {
            config.matching.footprint_buffer =
                parse_number("matching", "footprint_buffer", v, "must be a number of degrees")?;
        }
        if let Some(v) = section.get("strict_phase") {
            config.matching.strict_phase = parse_bool("matching", "strict_phase", v)?;
        }
    }

    // [dispatch] section
    if let Some(section) = ini.section(Some("dispatch")) {
        if let Some(v) = section.get("slots") {
            config.dispatch.slots =
                parse_number("dispatch", "slots", v, "must be a positive integer")?;
        }
        if let Some(v) = non_empty(section, "workers") {
            config.dispatch.workers =
                Some(parse_number("dispatch", "workers", v, "must be a positive integer")?);
        }
        if let Some(v) = section.get("search_days") {
            config.dispatch.search_days =
                parse_number("dispatch", "search_days", v, "must be a whole number of days")?;
        }
        if let Some(v) = section.get("stage_attempts") {
            config.dispatch.stage_attempts =
                parse_number("dispatch", "stage_attempts", v, "must be a positive integer")?;
        }
        if let Some(v) = section.get("stage_backoff_ms") {
            config.dispatch.stage_backoff_ms =
                parse_number("dispatch", "stage_backoff_ms", v, "must be milliseconds")?;
        }
    }

    // [registry] section
    if let Some(section) = ini.section(Some("registry")) {
        if let Some(v) = section.get("max_retries") {
            config.registry.max_retries =
                parse_number("registry", "max_retries", v, "must be a positive integer")?;
        }
        if let Some(v) = section.get("retry_delay_ms") {
            config.registry.retry_delay_ms =
                parse_number("registry", "retry_delay_ms", v, "must be milliseconds")?;
        }
        if let Some(v) = section.get("bounds_precision") {
            config.registry.bounds_precision =
                parse_number("registry", "bounds_precision", v, "must be a number of decimals")?;
        }
        if let Some(v) = section.get("validate_after_run") {
            config.registry.validate_after_run = parse_bool("registry", "validate_after_run", v)?;
        }
    }

    // [raster] section
    if let Some(section) = ini.section(Some("raster")) {
        if let Some(v) = section.get("raster_kinds") {
            config.raster.raster_kinds = v
                .split(',')
                .map(|kind| kind.trim().to_lowercase())
                .filter(|kind| !kind.is_empty())
                .collect();
        }
    }

    // [collaborators] section
    if let Some(section) = ini.section(Some("collaborators")) {
        config.collaborators.acquire = non_empty(section, "acquire").map(str::to_string);
        config.collaborators.ancillary = non_empty(section, "ancillary").map(str::to_string);
        config.collaborators.correction = non_empty(section, "correction").map(str::to_string);
        config.collaborators.clip = non_empty(section, "clip").map(str::to_string);
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = non_empty(section, "level") {
            config.logging.level = v.to_lowercase();
        }
    }

    Ok(config)
}

fn non_empty<'a>(section: &'a Properties, key: &str) -> Option<&'a str> {
    section.get(key).map(str::trim).filter(|v| !v.is_empty())
}

fn parse_number<T: FromStr>(
    section: &str,
    key: &str,
    value: &str,
    reason: &str,
) -> Result<T, ConfigFileError> {
    value.trim().parse().map_err(|_| ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigFileError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ConfigFileError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be true or false".to_string(),
        }),
    }
}

/// Expand a leading `~` to the home directory.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
