use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use super::CacheMetadata;

type Axis = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// In-memory view of all metadata plus the tag and OS-type indexes.
///
/// `by_tag` maps tag → value → keys, `by_os` maps OS type → version → keys.
/// Entries without an OS type are not in `by_os`; an entry with a type but
/// no version is indexed under the empty version.
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheMetadata>,
    by_tag: Axis,
    by_os: Axis,
    built_at: Option<Instant>,
}

impl CacheIndex {
    pub fn from_entries(entries: impl IntoIterator<Item = CacheMetadata>) -> Self {
        let mut index = Self::default();
        for meta in entries {
            index.insert(meta);
        }
        index.built_at = Some(Instant::now());
        index
    }

    /// True if never built or older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.built_at.map_or(true, |t| t.elapsed() > max_age)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&CacheMetadata> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, meta: CacheMetadata) {
        self.remove(&meta.key);
        for (tag, value) in &meta.tags {
            add(&mut self.by_tag, tag, value, &meta.key);
        }
        if let Some(os) = &meta.os_type {
            add(
                &mut self.by_os,
                os,
                meta.os_version.as_deref().unwrap_or(""),
                &meta.key,
            );
        }
        self.entries.insert(meta.key.clone(), meta);
    }

    pub fn remove(&mut self, key: &str) {
        let Some(old) = self.entries.remove(key) else {
            return;
        };
        for (tag, value) in &old.tags {
            drop_key(&mut self.by_tag, tag, value, key);
        }
        if let Some(os) = &old.os_type {
            drop_key(
                &mut self.by_os,
                os,
                old.os_version.as_deref().unwrap_or(""),
                key,
            );
        }
    }

    /// Entries carrying every `tag=value` pair, sorted by key.
    pub fn filter_tags(&self, filter: &BTreeMap<String, String>) -> Vec<CacheMetadata> {
        let mut candidates: Option<BTreeSet<&String>> = None;
        for (tag, value) in filter {
            let keys: BTreeSet<&String> = self
                .by_tag
                .get(tag)
                .and_then(|values| values.get(value))
                .map(|keys| keys.iter().collect())
                .unwrap_or_default();
            candidates = Some(match candidates {
                None => keys,
                Some(prev) => prev.intersection(&keys).copied().collect(),
            });
        }
        match candidates {
            None => self.entries.values().cloned().collect(),
            Some(keys) => keys
                .into_iter()
                .filter_map(|k| self.entries.get(k).cloned())
                .collect(),
        }
    }

    /// Entries for an OS type, optionally one version, sorted by key.
    pub fn filter_os(&self, os_type: &str, os_version: Option<&str>) -> Vec<CacheMetadata> {
        let Some(versions) = self.by_os.get(os_type) else {
            return Vec::new();
        };
        let keys: BTreeSet<&String> = match os_version {
            Some(v) => versions.get(v).map(|k| k.iter().collect()).unwrap_or_default(),
            None => versions.values().flatten().collect(),
        };
        keys.into_iter()
            .filter_map(|k| self.entries.get(k).cloned())
            .collect()
    }
}

fn add(axis: &mut Axis, name: &str, value: &str, key: &str) {
    axis.entry(name.to_string())
        .or_default()
        .entry(value.to_string())
        .or_default()
        .insert(key.to_string());
}

fn drop_key(axis: &mut Axis, name: &str, value: &str, key: &str) {
    if let Some(values) = axis.get_mut(name) {
        if let Some(keys) = values.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                values.remove(value);
            }
        }
        if values.is_empty() {
            axis.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &str, tags: &[(&str, &str)], os: Option<(&str, &str)>) -> CacheMetadata {
        let mut m = CacheMetadata::new(key);
        m.key = key.to_string();
        for (k, v) in tags {
            m = m.tag(k, v);
        }
        if let Some((t, v)) = os {
            m = m.os(Some(t), Some(v));
        }
        m
    }

    #[test]
    fn tag_filter_is_superset_match() {
        let index = CacheIndex::from_entries([
            meta("a", &[("board", "rk1"), ("stage", "base")], None),
            meta("b", &[("board", "rk1"), ("stage", "net")], None),
            meta("c", &[("board", "cm4")], None),
        ]);
        let mut filter = BTreeMap::new();
        filter.insert("board".to_string(), "rk1".to_string());
        let keys: Vec<_> = index.filter_tags(&filter).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        filter.insert("stage".to_string(), "net".to_string());
        let keys: Vec<_> = index.filter_tags(&filter).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["b"]);

        assert_eq!(index.filter_tags(&BTreeMap::new()).len(), 3);
    }

    #[test]
    fn reinsert_replaces_old_tags() {
        let mut index = CacheIndex::default();
        index.insert(meta("a", &[("board", "rk1")], Some(("ubuntu", "22.04"))));
        index.insert(meta("a", &[("board", "cm4")], None));
        let mut filter = BTreeMap::new();
        filter.insert("board".to_string(), "rk1".to_string());
        assert!(index.filter_tags(&filter).is_empty());
        assert!(index.filter_os("ubuntu", None).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn os_index_by_version() {
        let index = CacheIndex::from_entries([
            meta("a", &[], Some(("ubuntu", "22.04"))),
            meta("b", &[], Some(("ubuntu", "24.04"))),
            meta("c", &[], None),
        ]);
        assert_eq!(index.filter_os("ubuntu", None).len(), 2);
        assert_eq!(index.filter_os("ubuntu", Some("24.04"))[0].key, "b");
        assert!(index.filter_os("debian", None).is_empty());
        assert!(!index.is_stale(Duration::from_secs(60)));
        assert!(CacheIndex::default().is_stale(Duration::from_secs(60)));
    }
}
