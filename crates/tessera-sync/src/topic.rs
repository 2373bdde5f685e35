//! Gossip topic names and advertisement deduplication.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use tessera_core::DocId;

const COLLECTION_PREFIX: &str = "collection:";
const DOC_SEPARATOR: &str = "/doc:";

/// A gossip topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every document of a collection.
    Collection(String),
    /// A single document.
    Document { collection: String, doc_id: DocId },
}

impl Topic {
    pub fn name(&self) -> String {
        match self {
            Topic::Collection(collection) => collection_topic(collection),
            Topic::Document { collection, doc_id } => document_topic(collection, doc_id),
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        let rest = name.strip_prefix(COLLECTION_PREFIX)?;
        match rest.split_once(DOC_SEPARATOR) {
            Some((collection, doc)) => Some(Topic::Document {
                collection: collection.to_string(),
                doc_id: DocId::parse(doc).ok()?,
            }),
            None if !rest.is_empty() => Some(Topic::Collection(rest.to_string())),
            None => None,
        }
    }
}

pub fn collection_topic(collection: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, collection)
}

pub fn document_topic(collection: &str, doc_id: &DocId) -> String {
    format!("{}{}{}{}", COLLECTION_PREFIX, collection, DOC_SEPARATOR, doc_id)
}

/// Bounded set of recently seen keys with least-recently-used eviction.
pub struct SeenCache<K: Hash + Eq> {
    entries: LruCache<K, ()>,
}

impl<K: Hash + Eq> SeenCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Check membership, refreshing the entry if present.
    pub fn contains(&mut self, key: &K) -> bool {
        self.entries.get(key).is_some()
    }

    /// Insert a key. Returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        self.entries.put(key, ()).is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Fields;

    #[test]
    fn test_topic_names_round_trip() {
        let doc_id = DocId::derive("Users", &Fields::new());
        let collection = Topic::Collection("Users".into());
        let document = Topic::Document {
            collection: "Users".into(),
            doc_id: doc_id.clone(),
        };

        assert_eq!(collection.name(), "collection:Users");
        assert_eq!(document.name(), format!("collection:Users/doc:{}", doc_id));
        assert_eq!(Topic::parse(&collection.name()), Some(collection));
        assert_eq!(Topic::parse(&document.name()), Some(document));
        assert_eq!(Topic::parse("collection:"), None);
        assert_eq!(Topic::parse("users"), None);
    }

    #[test]
    fn test_seen_cache_evicts_least_recently_used() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert(1));
        assert!(cache.insert(2));
        assert!(!cache.insert(1));

        // 2 is now the oldest
        cache.insert(3);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_seen_cache_zero_capacity_holds_one() {
        let mut cache = SeenCache::new(0);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert_eq!(cache.len(), 1);
    }
}
