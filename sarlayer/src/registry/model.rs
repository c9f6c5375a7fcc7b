//! Registry data model.
//!
//! The registry is the durable record of every radar scene that has been
//! processed and every optical chip that was clipped against one.
//!
//! # Document shape
//!
//! ```text
//! {
//!   "S1A_IW_SLC__1SDV_20230101T000000_...": {
//!     "footprint": [10.0, 10.0, 12.0, 12.0],
//!     "acquisition_date": "2023-01-01T00:00:00Z",
//!     "disaster_phase": "pre",
//!     "base_outputs": { "vv": "...", "vh": "..." },
//!     "processed_at": "...",
//!     "chips": {
//!       "chip_001": { "bounds": [...], "outputs": {...}, "created_at": "...", "disaster_phase": "pre" }
//!     }
//!   }
//! }
//! ```
//!
//! Both maps keep insertion order. Matching relies on it for tie-breaking,
//! so scenes and chips are held as ordered vectors keyed by their id rather
//! than in a hash map.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::geo::BoundingBox;

/// Output kind for the VV polarization raster.
pub const OUTPUT_VV: &str = "vv";

/// Output kind for the VH polarization raster.
pub const OUTPUT_VH: &str = "vh";

/// Output kind for the clipped and merged chip product.
pub const OUTPUT_CLIPPED: &str = "clipped";

/// Mapping of output kind to file path.
pub type OutputMap = BTreeMap<String, PathBuf>;

/// Before/after-event tag used to prevent cross-phase reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisasterPhase {
    /// Imagery acquired before the event.
    #[serde(alias = "pre_disaster")]
    Pre,
    /// Imagery acquired after the event.
    #[serde(alias = "post_disaster")]
    Post,
    /// Phase could not be determined.
    Unknown,
}

impl DisasterPhase {
    /// The phase as an optional known value (`Unknown` maps to `None`).
    pub fn known(self) -> Option<DisasterPhase> {
        match self {
            DisasterPhase::Unknown => None,
            other => Some(other),
        }
    }

    /// Infer the phase from a chip path.
    ///
    /// The file stem is checked for `pre_disaster` / `post_disaster` first,
    /// then the parent directory name for `pre` / `post`.
    pub fn infer_from_path(path: &Path) -> DisasterPhase {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(phase) = Self::infer_from_name(&stem) {
            return phase;
        }

        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if parent.contains("pre") {
            DisasterPhase::Pre
        } else if parent.contains("post") {
            DisasterPhase::Post
        } else {
            DisasterPhase::Unknown
        }
    }

    /// Infer the phase from an explicit `pre_disaster` / `post_disaster` marker.
    pub fn infer_from_name(name: &str) -> Option<DisasterPhase> {
        let name = name.to_lowercase();
        if name.contains("pre_disaster") {
            Some(DisasterPhase::Pre)
        } else if name.contains("post_disaster") {
            Some(DisasterPhase::Post)
        } else {
            None
        }
    }

    /// Lowercase tag as written to the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisasterPhase::Pre => "pre",
            DisasterPhase::Post => "post",
            DisasterPhase::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DisasterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DisasterPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pre" | "pre_disaster" => Ok(DisasterPhase::Pre),
            "post" | "post_disaster" => Ok(DisasterPhase::Post),
            "unknown" | "" => Ok(DisasterPhase::Unknown),
            other => Err(format!("unknown disaster phase '{}'", other)),
        }
    }
}

/// A derived product for one requested chip footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipRecord {
    /// Chip identifier (the key in the parent's `chips` map).
    #[serde(skip)]
    pub chip_id: String,

    /// The requesting chip's bounds, rounded at write time. Never mutated.
    pub bounds: BoundingBox,

    /// Output kind → path; includes the clipped product.
    pub outputs: OutputMap,

    /// When this chip was registered.
    pub created_at: DateTime<Utc>,

    /// Phase at creation time.
    pub disaster_phase: DisasterPhase,
}

/// One processed radar acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    /// Scene identifier (the key in the registry map).
    #[serde(skip)]
    pub scene_id: String,

    /// Full scene extent.
    pub footprint: BoundingBox,

    /// Acquisition timestamp, if known. First write wins.
    #[serde(default)]
    pub acquisition_date: Option<DateTime<Utc>>,

    /// Phase tag, if known. First write wins.
    #[serde(default)]
    pub disaster_phase: Option<DisasterPhase>,

    /// Base outputs of the correction run (polarization rasters, etc.).
    #[serde(default)]
    pub base_outputs: OutputMap,

    /// When the scene was first processed.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,

    /// Chips clipped against this scene, in registration order.
    #[serde(default, with = "keyed")]
    pub chips: Vec<ChipRecord>,
}

impl SceneRecord {
    /// Look up a chip by id.
    pub fn chip(&self, chip_id: &str) -> Option<&ChipRecord> {
        self.chips.iter().find(|c| c.chip_id == chip_id)
    }

    /// True if this scene's known phase conflicts with `phase`.
    ///
    /// A scene without a phase, or a request of unknown phase, never conflicts.
    pub fn phase_conflicts_with(&self, phase: DisasterPhase) -> bool {
        match (self.disaster_phase.and_then(DisasterPhase::known), phase) {
            (Some(scene_phase), requested) => {
                requested != DisasterPhase::Unknown && scene_phase != requested
            }
            (None, _) => false,
        }
    }

    /// All file paths referenced by this scene and its chips.
    pub fn referenced_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.base_outputs
            .values()
            .chain(self.chips.iter().flat_map(|c| c.outputs.values()))
    }
}

/// Chip part of a [`SceneUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChipUpdate {
    /// Chip identifier.
    pub chip_id: String,
    /// Requested chip bounds (rounded when stored).
    pub bounds: BoundingBox,
    /// Chip outputs.
    pub outputs: OutputMap,
}

/// Input to the standard "register chip" mutation.
///
/// Creates the scene if it is absent, otherwise extends it. Scene-level
/// fields are only used at creation, except phase and date which fill in
/// values that were never set.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneUpdate {
    /// Scene identifier.
    pub scene_id: String,
    /// Full scene extent.
    pub footprint: BoundingBox,
    /// Acquisition date, if known.
    pub acquisition_date: Option<DateTime<Utc>>,
    /// Phase of the requesting chip.
    pub phase: DisasterPhase,
    /// Base outputs of the scene.
    pub base_outputs: OutputMap,
    /// The chip to add.
    pub chip: ChipUpdate,
}

impl SceneUpdate {
    /// Every path the update would write into the registry for a new scene.
    pub fn new_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.base_outputs.values().chain(self.chip.outputs.values())
    }
}

/// Effect of applying a [`SceneUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterEffect {
    /// A new scene was created with its first chip.
    SceneCreated,
    /// A chip was added to an existing scene.
    ChipAdded,
    /// The chip id already existed; nothing changed.
    ChipAlreadyPresent,
}

/// The in-memory registry: scene records in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    scenes: Vec<SceneRecord>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scenes.
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    /// True if no scenes are registered.
    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Total number of chips across all scenes.
    pub fn chip_count(&self) -> usize {
        self.scenes.iter().map(|s| s.chips.len()).sum()
    }

    /// Scenes in insertion order.
    pub fn scenes(&self) -> impl Iterator<Item = &SceneRecord> {
        self.scenes.iter()
    }

    /// Look up a scene by id.
    pub fn get(&self, scene_id: &str) -> Option<&SceneRecord> {
        self.scenes.iter().find(|s| s.scene_id == scene_id)
    }

    /// True if the scene id is registered.
    pub fn contains(&self, scene_id: &str) -> bool {
        self.get(scene_id).is_some()
    }

    /// Insert a scene, replacing any record with the same id in place.
    ///
    /// Only used when building a registry from scratch (rebuild, tests);
    /// normal operation goes through [`Registry::register`].
    pub fn insert(&mut self, scene: SceneRecord) {
        match self.scenes.iter_mut().find(|s| s.scene_id == scene.scene_id) {
            Some(existing) => *existing = scene,
            None => self.scenes.push(scene),
        }
    }

    /// Apply a [`SceneUpdate`].
    ///
    /// `precision` is the number of decimals kept for the stored chip bounds.
    pub fn register(
        &mut self,
        update: &SceneUpdate,
        now: DateTime<Utc>,
        precision: u32,
    ) -> RegisterEffect {
        let chip = ChipRecord {
            chip_id: update.chip.chip_id.clone(),
            bounds: update.chip.bounds.rounded(precision),
            outputs: update.chip.outputs.clone(),
            created_at: now,
            disaster_phase: update.phase,
        };

        match self
            .scenes
            .iter_mut()
            .find(|s| s.scene_id == update.scene_id)
        {
            Some(scene) => {
                if scene.disaster_phase.and_then(DisasterPhase::known).is_none() {
                    scene.disaster_phase = update.phase.known();
                }
                if scene.acquisition_date.is_none() {
                    scene.acquisition_date = update.acquisition_date;
                }
                if scene.chip(&chip.chip_id).is_some() {
                    return RegisterEffect::ChipAlreadyPresent;
                }
                scene.chips.push(chip);
                RegisterEffect::ChipAdded
            }
            None => {
                self.scenes.push(SceneRecord {
                    scene_id: update.scene_id.clone(),
                    footprint: update.footprint,
                    acquisition_date: update.acquisition_date,
                    disaster_phase: update.phase.known(),
                    base_outputs: update.base_outputs.clone(),
                    processed_at: Some(now),
                    chips: vec![chip],
                });
                RegisterEffect::SceneCreated
            }
        }
    }
}

impl Serialize for Registry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        keyed::serialize(&self.scenes, serializer)
    }
}

impl<'de> Deserialize<'de> for Registry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        keyed::deserialize(deserializer).map(|scenes| Registry { scenes })
    }
}

/// Records that live under a string key in an ordered JSON object.
trait Keyed {
    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
}

impl Keyed for SceneRecord {
    fn key(&self) -> &str {
        &self.scene_id
    }

    fn set_key(&mut self, key: String) {
        self.scene_id = key;
    }
}

impl Keyed for ChipRecord {
    fn key(&self) -> &str {
        &self.chip_id
    }

    fn set_key(&mut self, key: String) {
        self.chip_id = key;
    }
}

/// Serde adapter: `Vec<T>` ⇄ JSON object keyed by `T::key()`, order preserved.
///
/// Duplicate keys are rejected so a hand-edited document cannot violate id
/// uniqueness.
mod keyed {
    use super::*;

    #[allow(clippy::ptr_arg)]
    pub(super) fn serialize<S, T>(items: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Keyed + Serialize,
    {
        let mut map = serializer.serialize_map(Some(items.len()))?;
        for item in items {
            map.serialize_entry(item.key(), item)?;
        }
        map.end()
    }

    pub(super) fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Keyed + Deserialize<'de>,
    {
        deserializer.deserialize_map(KeyedVisitor(PhantomData))
    }

    struct KeyedVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for KeyedVisitor<T>
    where
        T: Keyed + Deserialize<'de>,
    {
        type Value = Vec<T>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of records keyed by id")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Vec<T>, A::Error> {
            let mut items: Vec<T> = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, mut value)) = access.next_entry::<String, T>()? {
                if items.iter().any(|existing| existing.key() == key) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate key '{}'",
                        key
                    )));
                }
                value.set_key(key);
                items.push(value);
            }
            Ok(items)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bbox(w: f64, s: f64, e: f64, n: f64) -> BoundingBox {
        BoundingBox::new(w, s, e, n).unwrap()
    }

    fn update(scene_id: &str, chip_id: &str, phase: DisasterPhase) -> SceneUpdate {
        SceneUpdate {
            scene_id: scene_id.to_string(),
            footprint: bbox(10.0, 10.0, 12.0, 12.0),
            acquisition_date: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
            phase,
            base_outputs: OutputMap::from([(OUTPUT_VV.to_string(), PathBuf::from("/rtc/vv.tif"))]),
            chip: ChipUpdate {
                chip_id: chip_id.to_string(),
                bounds: bbox(10.5, 10.5, 11.0, 11.0),
                outputs: OutputMap::from([(
                    OUTPUT_CLIPPED.to_string(),
                    PathBuf::from(format!("/final/{}_clipped.tif", chip_id)),
                )]),
            },
        }
    }

    #[test]
    fn test_phase_parsing_accepts_aliases() {
        assert_eq!("pre_disaster".parse::<DisasterPhase>(), Ok(DisasterPhase::Pre));
        assert_eq!("POST".parse::<DisasterPhase>(), Ok(DisasterPhase::Post));
        assert_eq!("".parse::<DisasterPhase>(), Ok(DisasterPhase::Unknown));
        assert!("during".parse::<DisasterPhase>().is_err());
    }

    #[test]
    fn test_phase_serde_aliases() {
        let p: DisasterPhase = serde_json::from_str("\"post_disaster\"").unwrap();
        assert_eq!(p, DisasterPhase::Post);
        assert_eq!(serde_json::to_string(&DisasterPhase::Pre).unwrap(), "\"pre\"");
    }

    #[test]
    fn test_infer_phase_from_stem_then_parent() {
        assert_eq!(
            DisasterPhase::infer_from_path(Path::new("/in/x/hurricane_00001_post_disaster.tif")),
            DisasterPhase::Post
        );
        assert_eq!(
            DisasterPhase::infer_from_path(Path::new("/in/pre_event/chip_7.tif")),
            DisasterPhase::Pre
        );
        assert_eq!(
            DisasterPhase::infer_from_path(Path::new("/in/misc/chip_7.tif")),
            DisasterPhase::Unknown
        );
    }

    #[test]
    fn test_phase_conflicts() {
        let mut registry = Registry::new();
        registry.register(&update("S1", "c1", DisasterPhase::Pre), Utc::now(), 6);
        let scene = registry.get("S1").unwrap();

        assert!(scene.phase_conflicts_with(DisasterPhase::Post));
        assert!(!scene.phase_conflicts_with(DisasterPhase::Pre));
        assert!(!scene.phase_conflicts_with(DisasterPhase::Unknown));
    }

    #[test]
    fn test_register_creates_then_extends() {
        let mut registry = Registry::new();
        let now = Utc::now();

        assert_eq!(
            registry.register(&update("S1", "c1", DisasterPhase::Pre), now, 6),
            RegisterEffect::SceneCreated
        );
        assert_eq!(
            registry.register(&update("S1", "c2", DisasterPhase::Pre), now, 6),
            RegisterEffect::ChipAdded
        );
        assert_eq!(
            registry.register(&update("S1", "c2", DisasterPhase::Pre), now, 6),
            RegisterEffect::ChipAlreadyPresent
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.chip_count(), 2);
    }

    #[test]
    fn test_register_phase_and_date_first_write_wins() {
        let mut registry = Registry::new();
        let now = Utc::now();

        let mut first = update("S1", "c1", DisasterPhase::Unknown);
        first.acquisition_date = None;
        registry.register(&first, now, 6);
        assert_eq!(registry.get("S1").unwrap().disaster_phase, None);

        // Unset fields are filled by a later update...
        registry.register(&update("S1", "c2", DisasterPhase::Post), now, 6);
        let scene = registry.get("S1").unwrap();
        assert_eq!(scene.disaster_phase, Some(DisasterPhase::Post));
        assert!(scene.acquisition_date.is_some());

        // ...but never overwritten once set.
        let mut later = update("S1", "c3", DisasterPhase::Pre);
        later.acquisition_date = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        registry.register(&later, now, 6);
        let scene = registry.get("S1").unwrap();
        assert_eq!(scene.disaster_phase, Some(DisasterPhase::Post));
        assert_eq!(
            scene.acquisition_date,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())
        );
        // The chip keeps its own phase.
        assert_eq!(scene.chip("c3").unwrap().disaster_phase, DisasterPhase::Pre);
    }

    #[test]
    fn test_register_rounds_chip_bounds() {
        let mut registry = Registry::new();
        let mut u = update("S1", "c1", DisasterPhase::Pre);
        u.chip.bounds = bbox(10.12345678, 10.5, 11.0, 11.0);
        registry.register(&u, Utc::now(), 4);

        let chip = registry.get("S1").unwrap().chip("c1").unwrap();
        assert_eq!(chip.bounds.west, 10.1235);
    }

    #[test]
    fn test_serde_preserves_insertion_order() {
        let mut registry = Registry::new();
        let now = Utc::now();
        for id in ["S9", "S1", "S5"] {
            registry.register(&update(id, "c", DisasterPhase::Pre), now, 6);
        }
        registry.register(&update("S1", "z", DisasterPhase::Pre), now, 6);
        registry.register(&update("S1", "a", DisasterPhase::Pre), now, 6);

        let json = serde_json::to_string_pretty(&registry).unwrap();
        let back: Registry = serde_json::from_str(&json).unwrap();

        let ids: Vec<_> = back.scenes().map(|s| s.scene_id.as_str()).collect();
        assert_eq!(ids, vec!["S9", "S1", "S5"]);
        let chips: Vec<_> = back
            .get("S1")
            .unwrap()
            .chips
            .iter()
            .map(|c| c.chip_id.as_str())
            .collect();
        assert_eq!(chips, vec!["c", "z", "a"]);
        assert_eq!(back, registry);
    }

    #[test]
    fn test_deserialize_rejects_duplicate_scene_ids() {
        let json = r#"{
            "S1": {"footprint": [0,0,1,1]},
            "S1": {"footprint": [0,0,1,1]}
        }"#;
        let err = serde_json::from_str::<Registry>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_deserialize_rejects_wrong_shape() {
        assert!(serde_json::from_str::<Registry>("[]").is_err());
        assert!(serde_json::from_str::<Registry>(r#"{"S1": {"footprint": "x"}}"#).is_err());
        assert!(serde_json::from_str::<Registry>(r#"{"S1": {}}"#).is_err());
    }

    #[test]
    fn test_deserialize_minimal_scene() {
        let registry: Registry =
            serde_json::from_str(r#"{"S1": {"footprint": [10,10,12,12]}}"#).unwrap();
        let scene = registry.get("S1").unwrap();
        assert!(scene.chips.is_empty());
        assert!(scene.acquisition_date.is_none());
        assert!(scene.disaster_phase.is_none());
    }
}
