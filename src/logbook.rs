//! Launch-config store
//!
//! Persists the exact parameters each component was started with, one JSON
//! file per component under `<data_dir>/launch/`. Records are read back only
//! when a component is restarted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::component::ComponentSpec;
use crate::component::launch::LaunchConfig;
use crate::error::Result;

/// On-disk store of launch configs
#[derive(Debug, Clone)]
pub struct Logbook {
    dir: PathBuf,
}

impl Logbook {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("launch"),
        }
    }

    pub fn path(&self, component: &str) -> PathBuf {
        self.dir.join(format!("{}.json", component))
    }

    /// Record the config a component was just started with
    ///
    /// Written to a temp file and renamed, so a reader never sees a partial record.
    pub fn record(&self, config: &LaunchConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let mut config = config.clone();
        config.recorded_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&config)?;

        let path = self.path(&config.component);
        let tmp = self.dir.join(format!(".{}.json.tmp", config.component));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(component = %config.component, path = %path.display(), "launch config recorded");
        Ok(path)
    }

    /// Read the recorded config for `spec`
    pub fn load(&self, spec: &ComponentSpec) -> Result<Option<LaunchConfig>> {
        let path = self.path(&spec.id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: LaunchConfig = serde_json::from_str(&content)?;
        config.validate(spec)?;
        Ok(Some(config))
    }

    /// Recorded config, or the manifest defaults when the record is unusable
    ///
    /// Never fails: a restart must not be blocked by a bad record.
    pub fn load_or_default(&self, spec: &ComponentSpec) -> LaunchConfig {
        match self.load(spec) {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!(component = %spec.id, "no launch config recorded, using defaults");
                LaunchConfig::from_spec(spec)
            }
            Err(e) => {
                warn!(component = %spec.id, error = %e, "unusable launch config, using defaults");
                LaunchConfig::from_spec(spec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::launch::LAUNCH_CONFIG_VERSION;
    use crate::error::Error;

    fn spec() -> ComponentSpec {
        ComponentSpec::native("workflow-worker", "/usr/local/bin/workflow-worker")
            .with_env("ENGINE_ADDR", "127.0.0.1:7233")
    }

    #[test]
    fn test_record_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let logbook = Logbook::new(dir.path());
        let spec = spec();

        let mut config = LaunchConfig::from_spec(&spec);
        config.mode = Some("local".to_string());
        let path = logbook.record(&config).unwrap();
        assert!(path.ends_with("launch/workflow-worker.json"));

        let loaded = logbook.load(&spec).unwrap().unwrap();
        assert_eq!(loaded.mode.as_deref(), Some("local"));
        assert_eq!(loaded.env, config.env);
        assert!(loaded.recorded_at.is_some());

        // No temp file left behind
        let entries: Vec<_> = fs::read_dir(dir.path().join("launch")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_missing_record_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let logbook = Logbook::new(dir.path());
        assert!(logbook.load(&spec()).unwrap().is_none());
        assert_eq!(logbook.load_or_default(&spec()), LaunchConfig::from_spec(&spec()));
    }

    #[test]
    fn test_corrupt_record_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let logbook = Logbook::new(dir.path());
        fs::create_dir_all(dir.path().join("launch")).unwrap();
        fs::write(logbook.path("workflow-worker"), "{ not json").unwrap();

        assert!(matches!(logbook.load(&spec()), Err(Error::Json(_))));
        assert_eq!(logbook.load_or_default(&spec()), LaunchConfig::from_spec(&spec()));
    }

    #[test]
    fn test_newer_format_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let logbook = Logbook::new(dir.path());
        let mut config = LaunchConfig::from_spec(&spec());
        config.format = LAUNCH_CONFIG_VERSION + 1;
        config.args = vec!["--from-the-future".to_string()];
        logbook.record(&config).unwrap();

        let loaded = logbook.load_or_default(&spec());
        assert_eq!(loaded.format, LAUNCH_CONFIG_VERSION);
        assert!(loaded.args.is_empty());
    }
}
