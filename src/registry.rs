use crate::error::{PersistenceError, RegistryError};
use crate::stream::Stream;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How recently a frame must have landed for a stream to count as live.
const LIVENESS_WINDOW: Duration = Duration::from_secs(3);

/// One configured push-egress target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDef {
    pub url: String,
    pub name: String,
    /// RTMPS peer certificate verification. Defaults to `false` (off) -
    /// this is typically an ingestion-node-to-CDN link the operator pins
    /// via the URL itself, per SPEC_FULL's open-question decision.
    #[serde(default)]
    pub verify_tls: bool,
}

/// A stream's persisted definition: its name and its push targets. The
/// unit of the on-disk persistence document and of the management-facing
/// `list`/`get`/`update` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDef {
    pub name: String,
    pub targets: Vec<TargetDef>,
}

/// Read-only external projection of a stream's live telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStatus {
    pub bitrate_kbps: u64,
    pub last_frame_time: Option<SystemTime>,
}

impl StreamStatus {
    pub fn is_live(&self) -> bool {
        match self.last_frame_time {
            Some(t) => SystemTime::now()
                .duration_since(t)
                .map(|age| age < LIVENESS_WINDOW)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn last_frame_time_unix(&self) -> i64 {
        self.last_frame_time
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Process-wide mapping of stream name -> [`Stream`], with persistence
/// hooks. The single lock here protects only the name -> Stream map itself;
/// everything below it (consumer lists, dispatcher state) is guarded
/// per-`Stream`, so long-running fan-out work never blocks a registry
/// lookup from another stream.
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<Stream>>>,
    persistence_path: String,
}

impl StreamRegistry {
    /// Loads `persistence_path` if it exists; a missing or corrupt file is
    /// logged and treated as "start empty", never as a startup failure.
    pub fn new(persistence_path: String) -> Arc<Self> {
        let registry = Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            persistence_path,
        });
        registry.load();
        registry
    }

    fn load(&self) {
        let data = match std::fs::read_to_string(&self.persistence_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                let err = PersistenceError::Read {
                    path: self.persistence_path.clone(),
                    source: e,
                };
                error!("{err}, starting empty");
                return;
            }
        };
        let defs: Vec<StreamDef> = match serde_json::from_str(&data) {
            Ok(defs) => defs,
            Err(e) => {
                let err = PersistenceError::Parse {
                    path: self.persistence_path.clone(),
                    source: e,
                };
                error!("{err}, starting empty");
                return;
            }
        };
        let mut streams = self.streams.lock().unwrap();
        for def in defs {
            info!("restored stream '{}' with {} target(s)", def.name, def.targets.len());
            streams.insert(def.name.clone(), Stream::new(def.name, def.targets));
        }
    }

    /// Atomic-replace write of the current set of stream definitions.
    /// Failures are logged and never propagated - the in-memory state
    /// remains authoritative until the next successful save.
    fn save(&self) {
        let defs = self.definitions();
        let json = match serde_json::to_string_pretty(&defs) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize stream definitions: {e}");
                return;
            }
        };
        let tmp_path = format!("{}.tmp", self.persistence_path);
        if let Err(e) = std::fs::write(&tmp_path, json) {
            error!(
                "{}",
                PersistenceError::Write {
                    path: tmp_path,
                    source: e,
                }
            );
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.persistence_path) {
            error!(
                "{}",
                PersistenceError::Write {
                    path: self.persistence_path.clone(),
                    source: e,
                }
            );
        }
    }

    fn definitions(&self) -> Vec<StreamDef> {
        let streams = self.streams.lock().unwrap();
        let mut names: Vec<_> = streams.keys().cloned().collect();
        names.sort();
        names.into_iter().map(|name| streams[&name].definition()).collect()
    }

    pub fn list(&self) -> Vec<StreamDef> {
        self.definitions()
    }

    pub fn get(&self, name: &str) -> Result<StreamDef, RegistryError> {
        self.lookup(name)
            .map(|s| s.definition())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Internal fast path used by the RTMP session: `publish`/`play` only
    /// need to know whether the stream exists and get a handle to it.
    pub fn lookup(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.lock().unwrap().get(name).cloned()
    }

    /// Upserts a stream definition. If `name` already has a live `Stream`,
    /// its target list is updated in place and its dispatcher, consumer
    /// lists and status are preserved; only a brand new name allocates a
    /// new `Stream`.
    pub fn update(&self, def: StreamDef) -> Result<(), RegistryError> {
        validate_targets(&def.targets)?;
        {
            let mut streams = self.streams.lock().unwrap();
            match streams.get(&def.name) {
                Some(existing) => existing.set_targets(def.targets),
                None => {
                    streams.insert(def.name.clone(), Stream::new(def.name.clone(), def.targets));
                }
            }
        }
        self.save();
        Ok(())
    }

    /// Signals the stream's dispatcher to quit (which closes every live
    /// consumer) and removes it from the map. Deleting an unknown name is
    /// silent, per spec.
    pub fn delete(&self, name: &str) {
        let removed = self.streams.lock().unwrap().remove(name);
        if let Some(stream) = removed {
            stream.quit();
        }
        self.save();
    }

    pub fn add_target(&self, name: &str, url: String, label: String) -> Result<(), RegistryError> {
        let target = TargetDef {
            url,
            name: label,
            verify_tls: false,
        };
        validate_targets(std::slice::from_ref(&target))?;
        let stream = self
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        stream.add_target(target);
        self.save();
        Ok(())
    }

    /// Removing a target that isn't present is silent, per spec.
    pub fn remove_target(&self, name: &str, url: &str) -> Result<(), RegistryError> {
        let stream = self
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        stream.remove_target(url);
        self.save();
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<StreamStatus, RegistryError> {
        self.lookup(name)
            .map(|s| s.status())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Not persisted: status is per-process live telemetry, not part of a
    /// `StreamDef`, so it does not trigger a save.
    pub fn update_status(
        &self,
        name: &str,
        last_frame_time: SystemTime,
        bitrate_kbps: u64,
    ) -> Result<(), RegistryError> {
        let stream = self
            .lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        stream.update_status(last_frame_time, bitrate_kbps);
        Ok(())
    }

    pub fn list_with_status(&self) -> Vec<(StreamDef, StreamStatus)> {
        let streams = self.streams.lock().unwrap();
        let mut names: Vec<_> = streams.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let stream = &streams[&name];
                (stream.definition(), stream.status())
            })
            .collect()
    }
}

fn validate_targets(targets: &[TargetDef]) -> Result<(), RegistryError> {
    for target in targets {
        let url = url::Url::parse(&target.url).map_err(|_| RegistryError::InvalidUrl(target.url.clone()))?;
        match url.scheme() {
            "rtmp" | "rtmps" => {}
            _ => return Err(RegistryError::InvalidUrl(target.url.clone())),
        }
        if url.host_str().is_none() {
            return Err(RegistryError::InvalidUrl(target.url.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> String {
        format!("/tmp/rtmp-relay-registry-test-{}.json", uuid::Uuid::new_v4())
    }

    #[test]
    fn update_then_get_round_trips() {
        let registry = StreamRegistry::new(tmp_path());
        registry
            .update(StreamDef {
                name: "alpha".to_string(),
                targets: vec![TargetDef {
                    url: "rtmp://a/live/k1".to_string(),
                    name: "a".to_string(),
                    verify_tls: false,
                }],
            })
            .unwrap();

        let def = registry.get("alpha").unwrap();
        assert_eq!(def.targets.len(), 1);
        assert!(registry.get("missing").is_err());
    }

    #[test]
    fn update_preserves_live_stream_object() {
        let registry = StreamRegistry::new(tmp_path());
        registry
            .update(StreamDef {
                name: "alpha".to_string(),
                targets: vec![],
            })
            .unwrap();
        let first = registry.lookup("alpha").unwrap();
        registry
            .update(StreamDef {
                name: "alpha".to_string(),
                targets: vec![TargetDef {
                    url: "rtmp://a/live/k1".to_string(),
                    name: "a".to_string(),
                    verify_tls: false,
                }],
            })
            .unwrap();
        let second = registry.lookup("alpha").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalid_target_url_rejected() {
        let registry = StreamRegistry::new(tmp_path());
        let result = registry.update(StreamDef {
            name: "alpha".to_string(),
            targets: vec![TargetDef {
                url: "not-a-url".to_string(),
                name: "a".to_string(),
                verify_tls: false,
            }],
        });
        assert!(matches!(result, Err(RegistryError::InvalidUrl(_))));
    }

    #[test]
    fn persistence_round_trips_across_registries() {
        let path = tmp_path();
        {
            let registry = StreamRegistry::new(path.clone());
            registry
                .update(StreamDef {
                    name: "s1".to_string(),
                    targets: vec![TargetDef {
                        url: "rtmp://a/live/k1".to_string(),
                        name: "a".to_string(),
                        verify_tls: false,
                    }],
                })
                .unwrap();
        }
        let reloaded = StreamRegistry::new(path.clone());
        let defs = reloaded.list();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "s1");
        assert_eq!(defs[0].targets[0].url, "rtmp://a/live/k1");

        let status = reloaded.status("s1").unwrap();
        assert!(!status.is_live());
        assert_eq!(status.bitrate_kbps, 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn delete_silences_add_target_and_status() {
        let registry = StreamRegistry::new(tmp_path());
        registry
            .update(StreamDef {
                name: "alpha".to_string(),
                targets: vec![],
            })
            .unwrap();
        registry.delete("alpha");
        assert!(registry
            .add_target("alpha", "rtmp://a/live/k1".to_string(), "a".to_string())
            .is_err());
        assert!(registry.status("alpha").is_err());
    }
}
