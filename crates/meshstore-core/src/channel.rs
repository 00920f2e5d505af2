//! Channel log (spec §4.6, C6)
//!
//! A channel is identified by `(channel_id, owner)`; its per-owner state is a
//! versioned **ChannelInfo** whose `head` points at the most recent
//! **ChannelEntry**. Each entry references a **CreationTime** wrapper, which in
//! turn references the payload — `ChannelEntry -> CreationTime{t, payload} ->
//! payload`, a singly-linked list going backward in time. Concurrent appenders
//! publish independent head versions; C4's CRDT merge reconciles them.

use crate::error::Result;
use crate::hash::{IdHash, ObjectHash};
use crate::object::{ObjectInstance, Value};
use crate::object_store::ObjectStore;
use crate::recipe::{Discipline, FieldRule, PrimitiveKind, Recipe, ReferenceKind, RuleKind};

pub const CHANNEL_INFO_RECIPE: &str = "ChannelInfo";
pub const CHANNEL_ENTRY_RECIPE: &str = "ChannelEntry";
pub const CREATION_TIME_RECIPE: &str = "CreationTime";

/// Recipes for the three object types channel storage is built from. Register
/// these once at instance start-up alongside any application recipes.
pub fn built_in_recipes() -> Vec<Recipe> {
    vec![
        Recipe::new(
            CHANNEL_INFO_RECIPE,
            Discipline::Versioned,
            vec![
                FieldRule::new("id", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("owner", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("head", RuleKind::Reference(ReferenceKind::Object)).optional(),
            ],
        ),
        Recipe::new(
            CHANNEL_ENTRY_RECIPE,
            Discipline::Unversioned,
            vec![
                FieldRule::new("data", RuleKind::Reference(ReferenceKind::Object)),
                FieldRule::new("previous", RuleKind::Reference(ReferenceKind::Object)).optional(),
            ],
        ),
        Recipe::new(
            CREATION_TIME_RECIPE,
            Discipline::Unversioned,
            vec![
                FieldRule::new("timestamp", RuleKind::Primitive(PrimitiveKind::Integer)),
                FieldRule::new("data", RuleKind::Reference(ReferenceKind::Object)),
            ],
        ),
    ]
}

/// `owner: NONE` is represented as the literal string `"NONE"`, matching how
/// the identifying subset of ChannelInfo (a plain string field) encodes it.
const NO_OWNER: &str = "NONE";

fn owner_key(owner: Option<IdHash>) -> String {
    owner.map(|o| o.to_hex()).unwrap_or_else(|| NO_OWNER.to_string())
}

fn channel_info_id_hash(store: &ObjectStore, channel_id: &str, owner: Option<IdHash>) -> Result<IdHash> {
    let stub = ObjectInstance::new(CHANNEL_INFO_RECIPE)
        .with_field("id", Value::String(channel_id.to_string()))
        .with_field("owner", Value::String(owner_key(owner)));
    Ok(store.store_id_object(&stub)?)
}

/// One materialized entry read back off the chain, with its own hash (used as
/// `previous` by the next insertion) and decoded payload timestamp/hash.
/// `payload` is only resolved when the query did not ask to `omit_data`.
#[derive(Clone, Debug)]
pub struct ChannelEntryView {
    pub entry_hash: ObjectHash,
    pub timestamp: i64,
    pub payload_hash: ObjectHash,
    pub payload: Option<ObjectInstance>,
    pub previous: Option<ObjectHash>,
}

fn load_entry(store: &ObjectStore, entry_hash: ObjectHash) -> Result<ChannelEntryView> {
    let entry = store.get(entry_hash, Some(CHANNEL_ENTRY_RECIPE))?;
    let creation_time_hash = match entry.field("data") {
        Some(Value::RefObject(h)) => *h,
        _ => return Err(crate::error::Error::RecipeRuleViolation("ChannelEntry.data must be a reference".into())),
    };
    let creation_time = store.get(creation_time_hash, Some(CREATION_TIME_RECIPE))?;
    let timestamp = match creation_time.field("timestamp") {
        Some(Value::Integer(t)) => *t,
        _ => return Err(crate::error::Error::RecipeRuleViolation("CreationTime.timestamp missing".into())),
    };
    let payload_hash = match creation_time.field("data") {
        Some(Value::RefObject(h)) => *h,
        _ => return Err(crate::error::Error::RecipeRuleViolation("CreationTime.data missing".into())),
    };
    let previous = match entry.field("previous") {
        Some(Value::RefObject(h)) => Some(*h),
        _ => None,
    };
    Ok(ChannelEntryView { entry_hash, timestamp, payload_hash, payload: None, previous })
}

/// Payload's recipe type name, for `ChannelQuery::types` filtering. A separate
/// lookup from `load_entry` since most callers never need it.
fn payload_type(store: &ObjectStore, payload_hash: ObjectHash) -> Result<String> {
    Ok(store.get(payload_hash, None)?.type_name)
}

fn head_hash(store: &ObjectStore, channel_id: &str, owner: Option<IdHash>) -> Result<Option<ObjectHash>> {
    let id_hash = channel_info_id_hash(store, channel_id, owner)?;
    match store.get_by_id(id_hash)? {
        Some(info) => Ok(match info.field("head") {
            Some(Value::RefObject(h)) => Some(*h),
            _ => None,
        }),
        None => Ok(None),
    }
}

/// Append payload `payload` with timestamp `t` to `(channel_id, owner)`'s log
/// (spec §4.6 "Append"). Returns the newly created entry's hash.
pub fn append(store: &ObjectStore, channel_id: &str, owner: Option<IdHash>, payload: ObjectInstance, t: i64, now: u64) -> Result<ObjectHash> {
    let payload_result = store.store_unversioned(payload)?;

    let creation_time = ObjectInstance::new(CREATION_TIME_RECIPE)
        .with_field("timestamp", Value::Integer(t))
        .with_field("data", Value::RefObject(payload_result.hash));
    let ct_result = store.store_unversioned(creation_time)?;

    // Walk backward from the current head until the first entry whose
    // timestamp <= t; the new entry is inserted immediately ahead of it.
    let mut previous = head_hash(store, channel_id, owner)?;
    loop {
        match previous {
            Some(candidate_hash) => {
                let candidate = load_entry(store, candidate_hash)?;
                if candidate.timestamp <= t {
                    break;
                }
                previous = candidate.previous;
            }
            None => break,
        }
    }

    let mut new_entry = ObjectInstance::new(CHANNEL_ENTRY_RECIPE).with_field("data", Value::RefObject(ct_result.hash));
    if let Some(p) = previous {
        new_entry = new_entry.with_field("previous", Value::RefObject(p));
    }
    let entry_result = store.store_unversioned(new_entry)?;

    let became_new_head = match head_hash(store, channel_id, owner)? {
        Some(current_head) => {
            let current = load_entry(store, current_head)?;
            t >= current.timestamp
        }
        None => true,
    };

    if became_new_head {
        let info = ObjectInstance::new(CHANNEL_INFO_RECIPE)
            .with_field("id", Value::String(channel_id.to_string()))
            .with_field("owner", Value::String(owner_key(owner)))
            .with_field("head", Value::RefObject(entry_result.hash));
        store.store_versioned(info, now)?;
    }

    Ok(entry_result.hash)
}

/// A query accepted by a channel iterator (spec §4.6 "Iteration").
#[derive(Clone, Debug, Default)]
pub struct ChannelQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub count: Option<usize>,
    pub types: Option<Vec<String>>,
    pub id: Option<ObjectHash>,
    pub omit_data: bool,
}

/// Newest-first iterator over one `(channel_id, owner)` log.
pub struct ChannelIterator<'a> {
    store: &'a ObjectStore,
    current: Option<ObjectHash>,
    query: ChannelQuery,
    emitted: usize,
}

impl<'a> ChannelIterator<'a> {
    pub fn new(store: &'a ObjectStore, channel_id: &str, owner: Option<IdHash>, query: ChannelQuery) -> Result<Self> {
        let head = head_hash(store, channel_id, owner)?;
        Ok(Self { store, current: head, query, emitted: 0 })
    }
}

impl<'a> Iterator for ChannelIterator<'a> {
    type Item = Result<ChannelEntryView>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.query.count {
            if self.emitted >= limit {
                return None;
            }
        }
        loop {
            let hash = self.current?;
            let mut view = match load_entry(self.store, hash) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            self.current = view.previous;

            if let Some(id) = self.query.id {
                if view.entry_hash != id {
                    continue;
                }
            }
            if let Some(to) = self.query.to {
                if view.timestamp > to {
                    continue;
                }
            }
            if let Some(from) = self.query.from {
                if view.timestamp < from {
                    // strictly decreasing timestamps mean nothing further matches
                    self.current = None;
                    return None;
                }
            }
            if let Some(types) = &self.query.types {
                match payload_type(self.store, view.payload_hash) {
                    Ok(t) if types.iter().any(|wanted| wanted == &t) => {}
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if !self.query.omit_data {
                match self.store.get(view.payload_hash, None) {
                    Ok(payload) => view.payload = Some(payload),
                    Err(e) => return Some(Err(e)),
                }
            }

            self.emitted += 1;
            return Some(Ok(view));
        }
    }
}

/// One source stream's front element, annotated for [`merge_most_current`].
struct MergeFront {
    iter_index: usize,
    view: ChannelEntryView,
}

/// An emitted value from [`merge_most_current`]: the entry plus which source
/// stream produced it and how many sources are still live (spec §4.6
/// "mergeIteratorMostCurrent").
#[derive(Clone, Debug)]
pub struct MergedEntry {
    pub entry: ChannelEntryView,
    pub iter_index: usize,
    pub active_iterator_count: usize,
}

/// Merge `k` newest-first streams into one newest-first stream: at each step,
/// emit the largest unseen timestamp among the streams' front elements, ties
/// broken by `channel_entry_hash` descending.
pub fn merge_most_current(mut sources: Vec<ChannelIterator<'_>>) -> Result<Vec<MergedEntry>> {
    let mut fronts: Vec<Option<MergeFront>> = Vec::with_capacity(sources.len());
    for (idx, source) in sources.iter_mut().enumerate() {
        fronts.push(source.next().transpose()?.map(|view| MergeFront { iter_index: idx, view }));
    }

    let mut output = Vec::new();
    loop {
        let active_count = fronts.iter().filter(|f| f.is_some()).count();
        if active_count == 0 {
            break;
        }

        let winner_idx = fronts
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i, f)))
            .max_by(|(_, a), (_, b)| {
                a.view
                    .timestamp
                    .cmp(&b.view.timestamp)
                    .then_with(|| a.view.entry_hash.to_hex().cmp(&b.view.entry_hash.to_hex()))
            })
            .map(|(i, _)| i)
            .expect("active_count > 0 guarantees a winner");

        let winner = fronts[winner_idx].take().unwrap();
        output.push(MergedEntry { entry: winner.view, iter_index: winner.iter_index, active_iterator_count: active_count });

        fronts[winner_idx] = sources[winner_idx].next().transpose()?.map(|view| MergeFront { iter_index: winner_idx, view });
    }

    Ok(output)
}
