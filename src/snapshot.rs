use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use glob::glob;
use serde::de::{Deserialize, DeserializeOwned, Deserializer, MapAccess, Visitor};
use serde_pickle::{DeOptions, Value};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Attribute map of a single case/paper or citation item.
pub type Attributes = OrderedMap<Value>;

/// Case/paper metadata keyed by LNI.
pub type NodeSnapshot = OrderedMap<Attributes>;

/// Citation items keyed by the citing LNI.
pub type EdgeSnapshot = OrderedMap<Vec<Attributes>>;

/// String-keyed map that keeps the order entries were pickled in.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Same semantics as a dict merge: an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V> IntoIterator for OrderedMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a dict with string keys")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap { entries })
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Deserialize a pickled mapping, gunzipping it first when the name ends in `.gz`.
pub fn load_snapshot<V: DeserializeOwned>(path: &Path) -> Result<OrderedMap<V>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;

    let snapshot = if is_gzip(path) {
        let mut content = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut content)
            .with_context(|| format!("gunzip {}", path.display()))?;
        debug!("Decompressed {} bytes from {}", content.len(), path.display());
        serde_pickle::from_slice(&content, DeOptions::new())
    } else {
        serde_pickle::from_reader(BufReader::new(file), DeOptions::new())
    }
    .with_context(|| format!("unpickle {}", path.display()))?;

    Ok(snapshot)
}

/// Expand a glob pattern into the non-empty snapshot files it names, sorted.
pub fn find_snapshot_files(pattern: &str) -> Result<Vec<PathBuf>> {
    info!("Searching for snapshot files with pattern: {}", pattern);

    let mut files = Vec::new();
    for entry in glob(pattern).with_context(|| format!("bad glob pattern {}", pattern))? {
        match entry {
            Ok(path) => {
                if path.is_file() && path.metadata()?.len() > 0 {
                    files.push(path);
                } else {
                    warn!("Skipping {} (empty or not a file)", path.display());
                }
            }
            Err(e) => warn!("Error reading glob entry: {}", e),
        }
    }

    if files.is_empty() {
        bail!("no snapshot files match {}", pattern);
    }

    files.sort();
    info!("Found {} snapshot files", files.len());
    Ok(files)
}
