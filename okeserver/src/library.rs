//! Song library contract and the manifest-backed implementation.
//!
//! Scanning a media tree, parsing filenames and indexing are outside this
//! server; the room only needs two operations, so the contract stays
//! narrow. [`ManifestLibrary`] loads a JSON manifest (one object per
//! song) and answers case-insensitive substring searches over title and
//! artist.

use std::path::Path;

use okeproto::SearchResult;
use serde::Deserialize;

/// One song as the library knows it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LibrarySong {
    pub song_id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u32,
    #[serde(default)]
    pub vocal_path: Option<String>,
    #[serde(default)]
    pub instrumental_path: Option<String>,
}

/// Library search collaborator.
pub trait SongLibrary: Send + Sync {
    fn search(&self, query: &str) -> Vec<SearchResult>;
    fn get_by_id(&self, song_id: &str) -> Option<LibrarySong>;
}

/// In-memory library loaded from a JSON manifest.
pub struct ManifestLibrary {
    songs: Vec<LibrarySong>,
}

impl ManifestLibrary {
    /// Loads the manifest file (a JSON array of songs).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let songs: Vec<LibrarySong> = serde_json::from_str(&data)?;
        tracing::info!(songs = songs.len(), manifest = %path.display(), "Library loaded");
        Ok(Self { songs })
    }

    /// An empty library; every search comes back empty.
    pub fn empty() -> Self {
        Self { songs: Vec::new() }
    }

    pub fn from_songs(songs: Vec<LibrarySong>) -> Self {
        Self { songs }
    }
}

impl SongLibrary for ManifestLibrary {
    fn search(&self, query: &str) -> Vec<SearchResult> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        self.songs
            .iter()
            .filter(|s| {
                s.title.to_lowercase().contains(&needle)
                    || s.artist.to_lowercase().contains(&needle)
            })
            .map(|s| SearchResult {
                song_id: s.song_id.clone(),
                title: s.title.clone(),
                artist: s.artist.clone(),
                duration_secs: s.duration_secs,
            })
            .collect()
    }

    fn get_by_id(&self, song_id: &str) -> Option<LibrarySong> {
        self.songs.iter().find(|s| s.song_id == song_id).cloned()
    }
}
