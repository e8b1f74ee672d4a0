//! Client mirror cache
//!
//! A client reconstructs server state from the JSON it receives. Every
//! tracked object is stored once, keyed by id, as a shallow value whose
//! object-valued members are `{"$ref": id}` stubs pointing at other entries.
//! Next to the live value each entry keeps the last acknowledged clone, so a
//! client can diff its own local edits into [`Notify`] messages.
//!
//! Member mutations follow the server's array rules exactly: deleting index 0
//! shifts, deleting the last index pops, and deleting any other index leaves
//! a hole that is then compacted away together with every other null slot.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::identity::ObjectId;
use crate::protocol::{EventType, Notify, ServerMessage};
use crate::value::{padded_len, reference_target, ID_FIELD, REF_FIELD};

/// Live value and last acknowledged clone of one object
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntry {
    pub live: Json,
    pub clone: Json,
}

/// Client-side map from object id to mirrored state
#[derive(Debug, Default)]
pub struct MirrorCache {
    entries: FxHashMap<ObjectId, MirrorEntry>,
}

fn stub(id: ObjectId) -> Json {
    let mut map = Map::new();
    map.insert(REF_FIELD.to_string(), Json::from(id.0));
    Json::Object(map)
}

fn parse_index(name: &str) -> Result<usize> {
    name.parse::<usize>()
        .map_err(|_| Error::type_error(format!("'{}' is not an array index", name)))
}

impl MirrorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tracked object in `value` and return it in stub form.
    ///
    /// Arrays carry their id as the trailing element and records carry it in
    /// `"$id"`; both are stripped. Values without an id are kept inline with
    /// their members scanned.
    pub fn scan(&mut self, value: &Json) -> Json {
        match value {
            Json::Array(items) => match items.split_last() {
                Some((Json::Number(n), rest)) if n.as_u64().is_some() => {
                    let id = ObjectId(n.as_u64().unwrap_or_default());
                    let live = Json::Array(rest.iter().map(|item| self.scan(item)).collect());
                    self.register(id, live);
                    stub(id)
                }
                _ => Json::Array(items.iter().map(|item| self.scan(item)).collect()),
            },
            Json::Object(map) => {
                if reference_target(map).is_some() {
                    return value.clone();
                }
                let members: Map<String, Json> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != ID_FIELD)
                    .map(|(k, v)| (k.clone(), self.scan(v)))
                    .collect();
                match map.get(ID_FIELD).and_then(Json::as_u64) {
                    Some(id) => {
                        self.register(ObjectId(id), Json::Object(members));
                        stub(ObjectId(id))
                    }
                    None => Json::Object(members),
                }
            }
            other => other.clone(),
        }
    }

    fn register(&mut self, id: ObjectId, live: Json) {
        self.entries.insert(
            id,
            MirrorEntry {
                clone: live.clone(),
                live,
            },
        );
    }

    pub fn get(&self, id: ObjectId) -> Option<&Json> {
        self.entries.get(&id).map(|entry| &entry.live)
    }

    /// Last acknowledged snapshot of `id`
    pub fn get_clone(&self, id: ObjectId) -> Option<&Json> {
        self.entries.get(&id).map(|entry| &entry.clone)
    }

    /// Live value for local edits; pick them up with [`diff`](Self::diff)
    pub fn live_mut(&mut self, id: ObjectId) -> Option<&mut Json> {
        self.entries.get_mut(&id).map(|entry| &mut entry.live)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<MirrorEntry> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a member that held no value
    pub fn put_member(&mut self, id: ObjectId, name: &str, value: &Json) -> Result<()> {
        self.set_member(id, name, value)
    }

    /// Replace a member's value
    pub fn set_member(&mut self, id: ObjectId, name: &str, value: &Json) -> Result<()> {
        let scanned = self.scan(value);
        let entry = self.entry_mut(id)?;
        write_member(&mut entry.live, name, scanned.clone())?;
        write_member(&mut entry.clone, name, scanned)
    }

    /// Remove a member
    pub fn delete_member(&mut self, id: ObjectId, name: &str) -> Result<()> {
        let entry = self.entry_mut(id)?;
        remove_member(&mut entry.live, name)?;
        remove_member(&mut entry.clone, name)
    }

    fn entry_mut(&mut self, id: ObjectId) -> Result<&mut MirrorEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| Error::reference_error(format!("object {} is not mirrored", id)))
    }

    /// Local edits to `id` since the last acknowledgement, as notifications.
    ///
    /// Array shrinkage is reported as deletes of the trailing indices, highest
    /// first, so each one pops on the server.
    pub fn diff(&self, id: ObjectId) -> Vec<Notify> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match (&entry.live, &entry.clone) {
            (Json::Array(live), Json::Array(clone)) => {
                for (idx, item) in live.iter().enumerate() {
                    match clone.get(idx) {
                        Some(old) if old == item => {}
                        Some(_) => out.push(Notify::new(id, EventType::PropertySet, &idx.to_string(), Some(item))),
                        None => out.push(Notify::new(id, EventType::PropertyPut, &idx.to_string(), Some(item))),
                    }
                }
                for idx in (live.len()..clone.len()).rev() {
                    out.push(Notify::new(id, EventType::PropertyDelete, &idx.to_string(), None));
                }
            }
            (Json::Object(live), Json::Object(clone)) => {
                for (name, item) in live {
                    match clone.get(name) {
                        Some(old) if old == item => {}
                        Some(_) => out.push(Notify::new(id, EventType::PropertySet, name, Some(item))),
                        None => out.push(Notify::new(id, EventType::PropertyPut, name, Some(item))),
                    }
                }
                for name in clone.keys().filter(|name| !live.contains_key(*name)) {
                    out.push(Notify::new(id, EventType::PropertyDelete, name, None));
                }
            }
            _ => {}
        }
        out
    }

    /// Accept the live value of `id` as acknowledged
    pub fn acknowledge(&mut self, id: ObjectId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.clone = entry.live.clone();
                true
            }
            None => false,
        }
    }

    /// Rebuild the full value of `id` with stubs resolved. An object already
    /// being expanded higher up the tree stays a stub.
    pub fn materialize(&self, id: ObjectId) -> Option<Json> {
        let live = self.get(id)?;
        let mut stack = FxHashSet::default();
        stack.insert(id);
        Some(self.expand(live, &mut stack))
    }

    fn expand(&self, value: &Json, stack: &mut FxHashSet<ObjectId>) -> Json {
        match value {
            Json::Array(items) => Json::Array(items.iter().map(|v| self.expand(v, stack)).collect()),
            Json::Object(map) => {
                if let Some(target) = reference_target(map) {
                    let Some(live) = self.get(target) else {
                        return value.clone();
                    };
                    if !stack.insert(target) {
                        return value.clone();
                    }
                    let out = self.expand(live, stack);
                    stack.remove(&target);
                    return out;
                }
                Json::Object(map.iter().map(|(k, v)| (k.clone(), self.expand(v, stack))).collect())
            }
            other => other.clone(),
        }
    }

    /// Apply a server message. Returns whether the cache changed.
    pub fn apply(&mut self, message: &ServerMessage) -> Result<bool> {
        match message {
            ServerMessage::HandshakeInform { state, .. } => {
                let Some(state) = state else {
                    return Ok(false);
                };
                let json: Json = serde_json::from_str(state)?;
                self.scan(&json);
                Ok(true)
            }
            ServerMessage::QueryInform { .. } => Ok(false),
            ServerMessage::EventInform(event) => {
                if !event.event.is_property_change() || !self.contains(event.target) {
                    return Ok(false);
                }
                match event.event {
                    EventType::PropertyDelete => self.delete_member(event.target, &event.name)?,
                    _ => {
                        let value = event.decode_value()?.unwrap_or(Json::Null);
                        if event.event == EventType::PropertyPut {
                            self.put_member(event.target, &event.name, &value)?;
                        } else {
                            self.set_member(event.target, &event.name, &value)?;
                        }
                    }
                }
                Ok(true)
            }
        }
    }
}

fn write_member(target: &mut Json, name: &str, value: Json) -> Result<()> {
    match target {
        Json::Array(items) => {
            let idx = parse_index(name)?;
            let len = padded_len(items.len(), idx)?;
            items.resize(len, Json::Null);
            items[idx] = value;
            Ok(())
        }
        Json::Object(map) => {
            map.insert(name.to_string(), value);
            Ok(())
        }
        _ => Err(Error::type_error(format!("cannot set '{}' on a primitive", name))),
    }
}

fn remove_member(target: &mut Json, name: &str) -> Result<()> {
    match target {
        Json::Array(items) => {
            let idx = parse_index(name)?;
            if idx >= items.len() {
                return Ok(());
            }
            if idx == 0 {
                items.remove(0);
            } else if idx == items.len() - 1 {
                items.pop();
            } else {
                items[idx] = Json::Null;
                items.retain(|item| !item.is_null());
            }
            Ok(())
        }
        Json::Object(map) => {
            map.remove(name);
            Ok(())
        }
        _ => Err(Error::type_error(format!("cannot delete '{}' from a primitive", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventInform;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cache_with(value: Json) -> MirrorCache {
        let mut cache = MirrorCache::new();
        cache.scan(&value);
        cache
    }

    #[test]
    fn test_scan_strips_ids_and_stubs_children() {
        let cache = cache_with(json!({"$id": 1, "title": "t", "items": [10, 20, 2]}));
        assert_eq!(cache.get(ObjectId(1)), Some(&json!({"title": "t", "items": {"$ref": 2}})));
        assert_eq!(cache.get(ObjectId(2)), Some(&json!([10, 20])));
        assert_eq!(cache.get_clone(ObjectId(2)), Some(&json!([10, 20])));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_array_delete_semantics() {
        let mut cache = cache_with(json!([10, 20, 30, 7]));
        let id = ObjectId(7);
        cache.delete_member(id, "0").unwrap();
        assert_eq!(cache.get(id), Some(&json!([20, 30])));

        let mut cache = cache_with(json!([10, 20, 30, 7]));
        cache.delete_member(id, "2").unwrap();
        assert_eq!(cache.get(id), Some(&json!([10, 20])));

        let mut cache = cache_with(json!([10, 20, 30, 7]));
        cache.delete_member(id, "1").unwrap();
        assert_eq!(cache.get(id), Some(&json!([10, 30])));
    }

    #[test]
    fn test_middle_delete_compacts_every_null_slot() {
        let mut cache = cache_with(json!([1, null, 2, 3, 4, 9]));
        cache.delete_member(ObjectId(9), "2").unwrap();
        assert_eq!(cache.get(ObjectId(9)), Some(&json!([1, 3, 4])));
    }

    #[test]
    fn test_set_pads_arrays() {
        let mut cache = cache_with(json!([1, 3]));
        cache.put_member(ObjectId(3), "3", &json!("x")).unwrap();
        assert_eq!(cache.get(ObjectId(3)), Some(&json!([1, null, null, "x"])));
    }

    #[test]
    fn test_set_far_past_end_is_refused() {
        let mut cache = cache_with(json!([1, 3]));
        for index in [usize::MAX.to_string(), "4000000000".to_string()] {
            assert!(cache.set_member(ObjectId(3), &index, &json!(2)).is_err());
        }
        assert_eq!(cache.get(ObjectId(3)), Some(&json!([1])));
    }

    #[test]
    fn test_diff_reports_local_edits() {
        let mut cache = cache_with(json!({"$id": 4, "a": 1, "b": 2}));
        let id = ObjectId(4);
        if let Some(Json::Object(map)) = cache.live_mut(id) {
            map.insert("a".into(), json!(5));
            map.insert("c".into(), json!(true));
            map.remove("b");
        }
        let diff = cache.diff(id);
        assert_eq!(
            diff,
            vec![
                Notify::new(id, EventType::PropertySet, "a", Some(&json!(5))),
                Notify::new(id, EventType::PropertyPut, "c", Some(&json!(true))),
                Notify::new(id, EventType::PropertyDelete, "b", None),
            ]
        );
        assert!(cache.acknowledge(id));
        assert!(cache.diff(id).is_empty());
    }

    #[test]
    fn test_diff_array_shrink_deletes_from_the_end() {
        let mut cache = cache_with(json!([1, 2, 3, 4, 8]));
        if let Some(Json::Array(items)) = cache.live_mut(ObjectId(8)) {
            items.truncate(2);
        }
        let names: Vec<_> = cache.diff(ObjectId(8)).into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["3", "2"]);
    }

    #[test]
    fn test_materialize_resolves_refs_and_cycles() {
        let cache = cache_with(json!({"$id": 1, "self": {"$ref": 1}, "list": ["a", 2]}));
        assert_eq!(
            cache.materialize(ObjectId(1)),
            Some(json!({"self": {"$ref": 1}, "list": ["a"]}))
        );
        assert_eq!(cache.materialize(ObjectId(99)), None);
    }

    #[test]
    fn test_apply_events() {
        let mut cache = cache_with(json!({"$id": 42, "count": 0}));
        let set = ServerMessage::EventInform(EventInform {
            event: EventType::PropertySet,
            target: ObjectId(42),
            name: "count".into(),
            value: Some("1".into()),
        });
        assert!(cache.apply(&set).unwrap());
        assert_eq!(cache.get(ObjectId(42)), Some(&json!({"count": 1})));
        assert!(cache.diff(ObjectId(42)).is_empty());

        let put = ServerMessage::EventInform(EventInform {
            event: EventType::PropertyPut,
            target: ObjectId(42),
            name: "tags".into(),
            value: Some(r#"["x", 43]"#.into()),
        });
        cache.apply(&put).unwrap();
        assert_eq!(cache.get(ObjectId(43)), Some(&json!(["x"])));

        let delete = ServerMessage::EventInform(EventInform {
            event: EventType::PropertyDelete,
            target: ObjectId(42),
            name: "count".into(),
            value: None,
        });
        cache.apply(&delete).unwrap();
        assert_eq!(cache.materialize(ObjectId(42)), Some(json!({"tags": ["x"]})));
    }

    #[test]
    fn test_apply_ignores_unknown_targets_and_console() {
        let mut cache = MirrorCache::new();
        let console = ServerMessage::EventInform(EventInform {
            event: EventType::Console,
            target: ObjectId(0),
            name: "error".into(),
            value: Some("\"boom\"".into()),
        });
        assert!(!cache.apply(&console).unwrap());
        let orphan = ServerMessage::EventInform(EventInform {
            event: EventType::PropertySet,
            target: ObjectId(5),
            name: "x".into(),
            value: Some("1".into()),
        });
        assert!(!cache.apply(&orphan).unwrap());
        assert!(cache.is_empty());
    }
}
