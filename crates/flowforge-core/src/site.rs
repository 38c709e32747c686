//! Site configuration: classes, flowtypes, sensors, and repository paths.
//!
//! The core consumes the site as a read-only interface — which sensors
//! collect a class, how `(class, type)` names map to numeric flowtype IDs,
//! and where an hourly file lives in the data repository. [`SiteConfig`] is
//! the JSON-backed implementation the CLI loads; anything else (a test
//! fixture, an embedded default) can implement [`Site`] instead.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::flowrec::{ClassId, FlowtypeId, SensorId};
use crate::timeutil::civil_hour_from_ms;

/// Read-only site interface consumed by the generator and the stream cache.
pub trait Site {
    /// Sensors that collect the given class, ascending by ID.
    fn sensors_for_class(&self, class: ClassId) -> Vec<SensorId>;

    /// Resolve a `(class, type)` name pair to a flowtype ID.
    fn flowtype_lookup(&self, class_name: &str, type_name: &str) -> Option<FlowtypeId>;

    /// Class a flowtype belongs to.
    fn flowtype_class(&self, flowtype: FlowtypeId) -> Option<ClassId>;

    /// Type name of a flowtype (e.g. `"inweb"`).
    fn flowtype_name(&self, flowtype: FlowtypeId) -> Option<&str>;

    /// Sensor name (e.g. `"S3"`).
    fn sensor_name(&self, sensor: SensorId) -> Option<&str>;

    /// Repository path of the hourly file for `(flowtype, sensor, hour)`:
    /// `<root>/<type>/<YYYY>/<MM>/<DD>/<type>-<sensor>_<YYYYMMDD.HH><suffix>`.
    fn pathname(
        &self,
        flowtype: FlowtypeId,
        sensor: SensorId,
        hour_ts: i64,
        suffix: Option<&str>,
    ) -> Option<PathBuf>;

    /// Flat incremental-file name for `(flowtype, sensor, hour)`:
    /// `<type>-<sensor>_<YYYYMMDD.HH>`.
    fn incremental_name(&self, flowtype: FlowtypeId, sensor: SensorId, hour_ts: i64)
    -> Option<String> {
        let type_name = self.flowtype_name(flowtype)?;
        let sensor_name = self.sensor_name(sensor)?;
        let (year, month, day, hour) = civil_hour_from_ms(hour_ts);
        Some(format!(
            "{type_name}-{sensor_name}_{year:04}{month:02}{day:02}.{hour:02}"
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TypeDef {
    name: String,
    id: FlowtypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassDef {
    name: String,
    id: ClassId,
    types: Vec<TypeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SensorDef {
    name: String,
    id: SensorId,
    classes: Vec<String>,
}

/// JSON-backed site configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    classes: Vec<ClassDef>,
    sensors: Vec<SensorDef>,
    #[serde(skip)]
    root: PathBuf,
}

impl SiteConfig {
    /// Load from a JSON file. Rejects duplicate flowtype or sensor IDs.
    pub fn load(path: &Path) -> io::Result<SiteConfig> {
        let config: SiteConfig =
            serde_json::from_reader(File::open(path)?).map_err(io::Error::other)?;
        config.validate().map_err(io::Error::other)?;
        Ok(config)
    }

    /// The built-in single-class site: class `all` with types `in`, `inweb`,
    /// `out`, `outweb` and sensors `S0`..`S2`.
    pub fn default_site() -> SiteConfig {
        let types = ["in", "inweb", "out", "outweb"]
            .iter()
            .enumerate()
            .map(|(id, name)| TypeDef {
                name: (*name).to_string(),
                id: id as FlowtypeId,
            })
            .collect();
        SiteConfig {
            classes: vec![ClassDef {
                name: "all".to_string(),
                id: 0,
                types,
            }],
            sensors: (0..3u16)
                .map(|id| SensorDef {
                    name: format!("S{id}"),
                    id,
                    classes: vec!["all".to_string()],
                })
                .collect(),
            root: PathBuf::new(),
        }
    }

    /// Set the repository root used by [`Site::pathname`].
    pub fn with_root(mut self, root: PathBuf) -> SiteConfig {
        self.root = root;
        self
    }

    fn validate(&self) -> Result<(), String> {
        let mut flowtypes = HashMap::new();
        for class in &self.classes {
            for t in &class.types {
                if let Some(prev) = flowtypes.insert(t.id, &class.name) {
                    return Err(format!(
                        "flowtype id {} defined by both {prev} and {}",
                        t.id, class.name
                    ));
                }
            }
        }
        let mut sensors = HashMap::new();
        for s in &self.sensors {
            if sensors.insert(s.id, ()).is_some() {
                return Err(format!("sensor id {} defined twice", s.id));
            }
            for class in &s.classes {
                if !self.classes.iter().any(|c| &c.name == class) {
                    return Err(format!("sensor {} names unknown class {class}", s.name));
                }
            }
        }
        Ok(())
    }

    fn class_of(&self, flowtype: FlowtypeId) -> Option<&ClassDef> {
        self.classes
            .iter()
            .find(|c| c.types.iter().any(|t| t.id == flowtype))
    }
}

impl Site for SiteConfig {
    fn sensors_for_class(&self, class: ClassId) -> Vec<SensorId> {
        let Some(class_def) = self.classes.iter().find(|c| c.id == class) else {
            return Vec::new();
        };
        let mut ids: Vec<SensorId> = self
            .sensors
            .iter()
            .filter(|s| s.classes.iter().any(|name| name == &class_def.name))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn flowtype_lookup(&self, class_name: &str, type_name: &str) -> Option<FlowtypeId> {
        self.classes
            .iter()
            .find(|c| c.name == class_name)?
            .types
            .iter()
            .find(|t| t.name == type_name)
            .map(|t| t.id)
    }

    fn flowtype_class(&self, flowtype: FlowtypeId) -> Option<ClassId> {
        self.class_of(flowtype).map(|c| c.id)
    }

    fn flowtype_name(&self, flowtype: FlowtypeId) -> Option<&str> {
        self.class_of(flowtype)?
            .types
            .iter()
            .find(|t| t.id == flowtype)
            .map(|t| t.name.as_str())
    }

    fn sensor_name(&self, sensor: SensorId) -> Option<&str> {
        self.sensors
            .iter()
            .find(|s| s.id == sensor)
            .map(|s| s.name.as_str())
    }

    fn pathname(
        &self,
        flowtype: FlowtypeId,
        sensor: SensorId,
        hour_ts: i64,
        suffix: Option<&str>,
    ) -> Option<PathBuf> {
        let type_name = self.flowtype_name(flowtype)?;
        let base = self.incremental_name(flowtype, sensor, hour_ts)?;
        let (year, month, day, _) = civil_hour_from_ms(hour_ts);
        let mut path = self.root.clone();
        path.push(type_name);
        path.push(format!("{year:04}"));
        path.push(format!("{month:02}"));
        path.push(format!("{day:02}"));
        path.push(match suffix {
            Some(s) => format!("{base}{s}"),
            None => base,
        });
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::ms_from_civil_hour;

    #[test]
    fn test_default_site_lookups() {
        let site = SiteConfig::default_site();
        assert_eq!(site.flowtype_lookup("all", "inweb"), Some(1));
        assert_eq!(site.flowtype_lookup("all", "nosuch"), None);
        assert_eq!(site.flowtype_lookup("other", "in"), None);
        assert_eq!(site.flowtype_class(3), Some(0));
        assert_eq!(site.flowtype_class(9), None);
        assert_eq!(site.flowtype_name(0), Some("in"));
        assert_eq!(site.sensor_name(2), Some("S2"));
        assert_eq!(site.sensors_for_class(0), vec![0, 1, 2]);
        assert!(site.sensors_for_class(7).is_empty());
    }

    #[test]
    fn test_pathname_layout() {
        let site = SiteConfig::default_site().with_root(PathBuf::from("/data"));
        let hour = ms_from_civil_hour(2009, 2, 12, 0);
        let path = site.pathname(1, 2, hour, None).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/inweb/2009/02/12/inweb-S2_20090212.00")
        );
        let with_suffix = site.pathname(1, 2, hour, Some(".tmp")).unwrap();
        assert!(with_suffix.to_string_lossy().ends_with("inweb-S2_20090212.00.tmp"));
    }

    #[test]
    fn test_incremental_name() {
        let site = SiteConfig::default_site();
        let hour = ms_from_civil_hour(2024, 12, 31, 23);
        assert_eq!(
            site.incremental_name(0, 1, hour).unwrap(),
            "in-S1_20241231.23"
        );
        assert!(site.incremental_name(42, 1, hour).is_none());
    }

    #[test]
    fn test_load_round_trip() {
        let site = SiteConfig::default_site();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.json");
        std::fs::write(&path, serde_json::to_string_pretty(&site).unwrap()).unwrap();
        let loaded = SiteConfig::load(&path).unwrap();
        assert_eq!(loaded.flowtype_lookup("all", "out"), Some(2));
    }

    #[test]
    fn test_duplicate_flowtype_rejected() {
        let json = r#"{
            "classes": [
                {"name": "a", "id": 0, "types": [{"name": "in", "id": 0}]},
                {"name": "b", "id": 1, "types": [{"name": "in", "id": 0}]}
            ],
            "sensors": []
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, json).unwrap();
        assert!(SiteConfig::load(&path).is_err());
    }
}
