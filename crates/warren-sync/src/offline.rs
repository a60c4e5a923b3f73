//! Static last-known level snapshots used when the server is unreachable.
//!
//! Documents look like
//!
//! ```json
//! { "version": 3,
//!   "map": { "adds": [...], "removes": [...] },
//!   "tiles": [...], "portals": [...], "items": [...] }
//! ```
//!
//! Every list may instead be written as an object keyed by comma-separated
//! coordinates (`"gx,gy,y": "normal"`, `"gx,gy": 12`, `"gx,gy,kind[,payload]":
//! 1.5`). Both shapes are normalized into wire ops here, so the rest of the
//! engine only ever sees one representation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use warren_net::{ItemKind, ItemOp, PortalOp, TileOp, VoxelKind, VoxelOp};

/// Errors produced while loading an offline snapshot.
#[derive(Debug, thiserror::Error)]
pub enum OfflineSnapshotError {
    /// File could not be read.
    #[error("failed to read offline snapshot: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not valid JSON or has the wrong shape.
    #[error("failed to parse offline snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    /// A keyed entry has an unusable key.
    #[error("invalid {field} key {key:?}")]
    InvalidKey {
        /// List the entry belongs to.
        field: &'static str,
        /// The offending key.
        key: String,
    },

    /// The document names a different level.
    #[error("snapshot is for level {found:?}, expected {expected:?}")]
    LevelMismatch {
        /// Level that was requested.
        expected: String,
        /// Level the document declares.
        found: String,
    },

    /// The level name cannot be used as a file name.
    #[error("level name {0:?} cannot be used as a file name")]
    InvalidLevelName(String),
}

/// A fully normalized offline snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfflineSnapshot {
    /// Version the channels are set to.
    pub version: u64,
    /// Voxel adds followed by voxel removes.
    pub map: Vec<VoxelOp>,
    /// Tile overrides.
    pub tiles: Vec<TileOp>,
    /// Portal links.
    pub portals: Vec<PortalOp>,
    /// Items.
    pub items: Vec<ItemOp>,
}

impl OfflineSnapshot {
    /// Parse a document, checking its declared level (if any) against `level`.
    pub fn parse(text: &str, level: &str) -> Result<Self, OfflineSnapshotError> {
        let doc: RawDocument = serde_json::from_str(text)?;

        if let Some(found) = doc.level.filter(|found| found != level) {
            return Err(OfflineSnapshotError::LevelMismatch {
                expected: level.to_string(),
                found,
            });
        }

        let mut map = Vec::new();
        for (gx, gy, y, t) in doc.map.adds.normalize("map.adds", voxel_add)? {
            map.push(VoxelOp::Add { gx, gy, y, t });
        }
        for (gx, gy, y) in doc.map.removes.normalize("map.removes", voxel_remove)? {
            map.push(VoxelOp::Remove { gx, gy, y });
        }

        Ok(Self {
            version: doc.version,
            map,
            tiles: doc.tiles.normalize("tiles", tile_add)?,
            portals: doc.portals.normalize("portals", portal_add)?,
            items: doc.items.normalize("items", item_add)?,
        })
    }

    /// Read and parse `<dir>/<level>.json`.
    pub fn load(dir: &Path, level: &str) -> Result<Self, OfflineSnapshotError> {
        let path = snapshot_path(dir, level)?;
        let text = std::fs::read_to_string(&path)?;
        let snapshot = Self::parse(&text, level)?;
        tracing::info!(path = %path.display(), version = snapshot.version, "Loaded offline snapshot");
        Ok(snapshot)
    }
}

/// Location of the offline snapshot for `level` inside `dir`.
pub fn snapshot_path(dir: &Path, level: &str) -> Result<PathBuf, OfflineSnapshotError> {
    let usable = !level.is_empty()
        && level != "."
        && level != ".."
        && !level.contains(['/', '\\', '\0']);
    if !usable {
        return Err(OfflineSnapshotError::InvalidLevelName(level.to_string()));
    }
    Ok(dir.join(format!("{level}.json")))
}

// ---------------------------------------------------------------------------
// Raw document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    map: RawMap,
    #[serde(default)]
    tiles: SeqOrMap<RawTile>,
    #[serde(default)]
    portals: SeqOrMap<RawPortal>,
    #[serde(default)]
    items: SeqOrMap<RawItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMap {
    #[serde(default)]
    adds: SeqOrMap<RawVoxelAdd>,
    #[serde(default)]
    removes: SeqOrMap<RawVoxelRemove>,
}

/// A list written either as a sequence of entries or as a keyed object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeqOrMap<T> {
    Seq(Vec<T>),
    Map(BTreeMap<String, serde_json::Value>),
}

impl<T> Default for SeqOrMap<T> {
    fn default() -> Self {
        SeqOrMap::Seq(Vec::new())
    }
}

impl<T: DeserializeOwned> SeqOrMap<T> {
    /// Convert every entry with `entry`, which receives either a full entry
    /// or a split key plus its value.
    fn normalize<O>(
        self,
        field: &'static str,
        entry: fn(Entry<T>) -> Option<O>,
    ) -> Result<Vec<O>, OfflineSnapshotError> {
        match self {
            SeqOrMap::Seq(items) => Ok(items
                .into_iter()
                .filter_map(|item| entry(Entry::Full(item)))
                .collect()),
            SeqOrMap::Map(map) => map
                .into_iter()
                .map(|(key, value)| {
                    let parts: Vec<&str> = key.split(',').map(str::trim).collect();
                    entry(Entry::Keyed(&parts, value)).ok_or_else(|| {
                        OfflineSnapshotError::InvalidKey {
                            field,
                            key: key.clone(),
                        }
                    })
                })
                .collect(),
        }
    }
}

enum Entry<'a, T> {
    Full(T),
    Keyed(&'a [&'a str], serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct RawVoxelAdd {
    gx: i32,
    gy: i32,
    y: i32,
    t: VoxelKind,
}

#[derive(Debug, Deserialize)]
struct RawVoxelRemove {
    gx: i32,
    gy: i32,
    y: i32,
}

#[derive(Debug, Deserialize)]
struct RawTile {
    gx: i32,
    gy: i32,
    tile: u32,
}

#[derive(Debug, Deserialize)]
struct RawPortal {
    gx: i32,
    gy: i32,
    dest: String,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    gx: i32,
    gy: i32,
    #[serde(default)]
    y: f32,
    kind: ItemKind,
    #[serde(default)]
    payload: Option<String>,
}

fn int(s: &str) -> Option<i32> {
    s.parse().ok()
}

fn voxel_add(entry: Entry<RawVoxelAdd>) -> Option<(i32, i32, i32, VoxelKind)> {
    match entry {
        Entry::Full(v) => Some((v.gx, v.gy, v.y, v.t)),
        Entry::Keyed(&[gx, gy, y], value) => {
            let t = serde_json::from_value(value).ok()?;
            Some((int(gx)?, int(gy)?, int(y)?, t))
        }
        Entry::Keyed(..) => None,
    }
}

fn voxel_remove(entry: Entry<RawVoxelRemove>) -> Option<(i32, i32, i32)> {
    match entry {
        Entry::Full(v) => Some((v.gx, v.gy, v.y)),
        // Keyed removes carry no meaningful value.
        Entry::Keyed(&[gx, gy, y], _) => Some((int(gx)?, int(gy)?, int(y)?)),
        Entry::Keyed(..) => None,
    }
}

fn tile_add(entry: Entry<RawTile>) -> Option<TileOp> {
    match entry {
        Entry::Full(t) => Some(TileOp::Add {
            gx: t.gx,
            gy: t.gy,
            tile: t.tile,
        }),
        Entry::Keyed(&[gx, gy], value) => Some(TileOp::Add {
            gx: int(gx)?,
            gy: int(gy)?,
            tile: u32::try_from(value.as_u64()?).ok()?,
        }),
        Entry::Keyed(..) => None,
    }
}

fn portal_add(entry: Entry<RawPortal>) -> Option<PortalOp> {
    match entry {
        Entry::Full(p) => Some(PortalOp::Add {
            gx: p.gx,
            gy: p.gy,
            dest: p.dest,
        }),
        Entry::Keyed(&[gx, gy], value) => Some(PortalOp::Add {
            gx: int(gx)?,
            gy: int(gy)?,
            dest: value.as_str()?.to_string(),
        }),
        Entry::Keyed(..) => None,
    }
}

fn item_add(entry: Entry<RawItem>) -> Option<ItemOp> {
    match entry {
        Entry::Full(i) => Some(ItemOp::Add {
            gx: i.gx,
            gy: i.gy,
            y: i.y,
            kind: i.kind,
            payload: i.payload,
        }),
        Entry::Keyed(parts, value) if parts.len() >= 3 => {
            let kind =
                serde_json::from_value(serde_json::Value::String(parts[2].to_string())).ok()?;
            // Payload text may itself contain commas.
            let payload = (parts.len() > 3).then(|| parts[3..].join(","));
            Some(ItemOp::Add {
                gx: int(parts[0])?,
                gy: int(parts[1])?,
                y: value.as_f64()? as f32,
                kind,
                payload,
            })
        }
        Entry::Keyed(..) => None,
    }
}
