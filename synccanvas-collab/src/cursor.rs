//! Remote cursors and their projection into the local editor state.
//!
//! Remote cursors arrive as absolute character offsets computed against the
//! sender's copy of the document. Locally they become display-only markers
//! which are then carried through every local edit by a position [`Mapping`]:
//!
//! ```text
//! cursor_move{pos} ──► RemoteCursorMap (upsert) ──► CursorProjection::set_cursors
//!                                                        │ clamp to [0, len]
//!                                                        ▼
//!                           local Transaction ──► markers mapped through StepMaps
//! ```
//!
//! Nothing here depends on a particular text engine; a transaction is only a
//! list of replaced ranges.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::identity::CursorColor;

/// Last known selection of another participant. Also the `cursor_move`
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_id: Uuid,
    pub user_name: String,
    pub color: CursorColor,
    #[serde(deserialize_with = "deserialize_offset")]
    pub pos: usize,
}

/// Offsets computed by peers can be negative; those clamp to the start.
fn deserialize_offset<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let raw = i64::deserialize(deserializer)?;
    Ok(usize::try_from(raw).unwrap_or(0))
}

/// Remote cursors owned by one session, at most one per user.
#[derive(Debug, Clone, Default)]
pub struct RemoteCursorMap {
    cursors: Vec<RemoteCursor>,
}

impl RemoteCursorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any cursor for the same user wholesale. The updated cursor
    /// moves to the end, so iteration order is "least recently moved first".
    pub fn upsert(&mut self, cursor: RemoteCursor) {
        self.cursors.retain(|c| c.user_id != cursor.user_id);
        self.cursors.push(cursor);
    }

    pub fn remove(&mut self, user_id: &Uuid) -> Option<RemoteCursor> {
        let index = self.cursors.iter().position(|c| c.user_id == *user_id)?;
        Some(self.cursors.remove(index))
    }

    /// Cursors of users in `present`, in map order. The map itself keeps
    /// every last-seen cursor.
    pub fn visible(&self, present: &HashSet<Uuid>) -> Vec<RemoteCursor> {
        self.cursors
            .iter()
            .filter(|c| present.contains(&c.user_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&RemoteCursor> {
        self.cursors.iter().find(|c| c.user_id == *user_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn to_vec(&self) -> Vec<RemoteCursor> {
        self.cursors.clone()
    }
}

/// Which side of an edit boundary a mapped position sticks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assoc {
    /// Stay before content inserted exactly at the position.
    Before,
    /// Move past content inserted exactly at the position.
    #[default]
    After,
}

/// One replaced range: `old_size` characters at `start` became `new_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMap {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

impl StepMap {
    pub fn insert(at: usize, len: usize) -> Self {
        Self { start: at, old_size: 0, new_size: len }
    }

    pub fn delete(from: usize, len: usize) -> Self {
        Self { start: from, old_size: len, new_size: 0 }
    }

    pub fn replace(from: usize, old_size: usize, new_size: usize) -> Self {
        Self { start: from, old_size, new_size }
    }

    /// Map a position from before this step to after it.
    ///
    /// Positions before the range are unchanged, positions after it shift by
    /// the size difference. Positions inside a deleted range collapse to its
    /// start; the range boundaries keep their side, and a pure insertion at
    /// the position defers to `assoc`.
    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        let end = self.start + self.old_size;
        if pos < self.start {
            return pos;
        }
        if pos > end {
            return pos - self.old_size + self.new_size;
        }

        let side = if self.old_size == 0 {
            assoc
        } else if pos == self.start {
            Assoc::Before
        } else if pos == end {
            Assoc::After
        } else {
            assoc
        };

        match side {
            Assoc::Before => self.start,
            Assoc::After => self.start + self.new_size,
        }
    }
}

/// Ordered sequence of step maps, each expressed in the coordinates left by
/// the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, map: StepMap) {
        self.maps.push(map);
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.maps.iter().fold(pos, |pos, step| step.map(pos, assoc))
    }
}

/// A local edit as seen by the projection: the position mapping it induces
/// plus optional metadata.
///
/// Steps are clamped against the running document length, so a transaction
/// built from stale offsets never produces positions past the end.
#[derive(Debug, Clone)]
pub struct Transaction {
    mapping: Mapping,
    doc_len_before: usize,
    doc_len: usize,
    remote_cursors: Option<Vec<RemoteCursor>>,
}

impl Transaction {
    /// Empty transaction against a document of `doc_len` characters.
    pub fn new(doc_len: usize) -> Self {
        Self {
            mapping: Mapping::new(),
            doc_len_before: doc_len,
            doc_len,
            remote_cursors: None,
        }
    }

    pub fn insert(self, at: usize, len: usize) -> Self {
        self.replace(at, 0, len)
    }

    pub fn delete(self, from: usize, len: usize) -> Self {
        self.replace(from, len, 0)
    }

    pub fn replace(mut self, from: usize, old_size: usize, new_size: usize) -> Self {
        let from = from.min(self.doc_len);
        let old_size = old_size.min(self.doc_len - from);
        if old_size == new_size && old_size == 0 {
            return self;
        }
        self.mapping.push(StepMap::replace(from, old_size, new_size));
        self.doc_len = self.doc_len - old_size + new_size;
        self
    }

    /// Attach a fresh remote cursor set; the projection rebuilds its markers
    /// from it instead of mapping the old ones.
    pub fn with_remote_cursors(mut self, cursors: Vec<RemoteCursor>) -> Self {
        self.remote_cursors = Some(cursors);
        self
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn doc_len_before(&self) -> usize {
        self.doc_len_before
    }

    /// Document length after the transaction.
    pub fn doc_len(&self) -> usize {
        self.doc_len
    }

    pub fn remote_cursors(&self) -> Option<&[RemoteCursor]> {
        self.remote_cursors.as_deref()
    }

    pub fn doc_changed(&self) -> bool {
        !self.mapping.is_empty()
    }
}

/// Display-only caret of a remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorMarker {
    pub user_id: Uuid,
    pub user_name: String,
    pub color: CursorColor,
    pub pos: usize,
}

impl CursorMarker {
    fn from_cursor(cursor: &RemoteCursor, doc_len: usize) -> Self {
        Self {
            user_id: cursor.user_id,
            user_name: cursor.user_name.clone(),
            color: cursor.color,
            pos: cursor.pos.min(doc_len),
        }
    }
}

/// Remote cursor markers inside the local editor state.
#[derive(Debug, Clone)]
pub struct CursorProjection {
    markers: BTreeMap<Uuid, CursorMarker>,
    doc_len: usize,
    assoc: Assoc,
}

impl CursorProjection {
    pub fn new(doc_len: usize) -> Self {
        Self {
            markers: BTreeMap::new(),
            doc_len,
            assoc: Assoc::After,
        }
    }

    /// Side markers take when text is inserted exactly at them.
    pub fn with_assoc(mut self, assoc: Assoc) -> Self {
        self.assoc = assoc;
        self
    }

    /// Carry the projection through a local transaction.
    pub fn apply(&mut self, tr: &Transaction) {
        self.doc_len = tr.doc_len();
        if let Some(cursors) = tr.remote_cursors() {
            self.rebuild(cursors);
            return;
        }
        if !tr.doc_changed() {
            return;
        }
        for marker in self.markers.values_mut() {
            marker.pos = tr.mapping().map(marker.pos, self.assoc).min(self.doc_len);
        }
    }

    /// Replace the whole marker set with `cursors`. An empty slice clears it.
    pub fn set_cursors(&mut self, cursors: &[RemoteCursor]) {
        self.rebuild(cursors);
    }

    /// Tell the projection the document was replaced wholesale (e.g. a
    /// remote snapshot). Markers are clamped, not mapped.
    pub fn reset_doc_len(&mut self, doc_len: usize) {
        self.doc_len = doc_len;
        for marker in self.markers.values_mut() {
            marker.pos = marker.pos.min(doc_len);
        }
    }

    fn rebuild(&mut self, cursors: &[RemoteCursor]) {
        let doc_len = self.doc_len;
        self.markers = cursors
            .iter()
            .map(|cursor| (cursor.user_id, CursorMarker::from_cursor(cursor, doc_len)))
            .collect();
    }

    pub fn markers(&self) -> impl Iterator<Item = &CursorMarker> {
        self.markers.values()
    }

    pub fn marker(&self, user_id: &Uuid) -> Option<&CursorMarker> {
        self.markers.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn doc_len(&self) -> usize {
        self.doc_len
    }
}
