//! Track catalog: static reference data keyed by track name.

use rally_core::{validate_track, Track, ValidationError};
use serde::{Deserialize, Serialize};

/// Ordered set of tracks; names are unique.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackCatalog {
    tracks: Vec<Track>,
}

fn track(name: &str, factor: f64, description: &str) -> Track {
    Track {
        name: name.to_string(),
        factor,
        description: description.to_string(),
    }
}

impl TrackCatalog {
    /// The four stock tracks.
    pub fn builtin() -> Self {
        Self {
            tracks: vec![
                track("Asphalt Sprint", 1.00, "Fast, clean asphalt"),
                track("Desert Loop", 0.92, "Sand reduces grip"),
                track("Forest Run", 0.96, "Mixed terrain, narrow"),
                track("Mountain Pass", 0.90, "Steep climbs, tricky"),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.name == name)
    }

    /// Like [`get`](Self::get) but unknown names are a validation error.
    pub fn require(&self, name: &str) -> Result<&Track, ValidationError> {
        self.get(name)
            .ok_or_else(|| ValidationError::UnknownTrack(name.to_string()))
    }

    /// Track names in catalog order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tracks.iter().map(|t| t.name.as_str())
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Add tracks, replacing any existing entry with the same name.
    ///
    /// Every track is validated before the catalog is touched.
    pub fn extend<I>(&mut self, extra: I) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = Track>,
    {
        let extra: Vec<Track> = extra.into_iter().collect();
        for t in &extra {
            validate_track(t)?;
        }
        for t in extra {
            match self.tracks.iter_mut().find(|e| e.name == t.name) {
                Some(existing) => *existing = t,
                None => self.tracks.push(t),
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
