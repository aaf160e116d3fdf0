//! Ephemeral "who is here and what are they touching" state.
//!
//! ```text
//! tab connects ──► track_user ──┐
//! cursor moves ──► update_* ────┼──► {joins, leaves} diff ──► workflow topic
//! tab closes ───► untrack ──────┘                                  │
//!                                                                  ▼
//!                              PresenceView: diff ⇒ refetch list_users ⇒ flatten
//! ```
//!
//! A user may hold several metas at once, one per connection. Subscribers
//! never patch their view from a diff: every diff triggers a refetch of the
//! whole list, which is then flattened into one entry per user.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use flowdraft_core::now_millis;

use crate::broadcast::{RoomManager, Topic};
use crate::protocol::ServerMessage;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Identifies one connection (one browser tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnRef(pub Uuid);

impl ConnRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity announced in the `join` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
        }
    }
}

/// Canvas position of a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A user's profile as shown to others, with its display color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// `#rrggbb`
    pub color: String,
}

impl From<UserInfo> for PresenceUser {
    fn from(user: UserInfo) -> Self {
        let color = UserColor::from_user_id(&user.id).hex();
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            color,
        }
    }
}

/// State of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub conn_ref: ConnRef,
    pub user: PresenceUser,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub selected_steps: Vec<String>,
    #[serde(default)]
    pub focused_step: Option<String>,
    #[serde(default)]
    pub dragging_steps: Vec<String>,
    pub online_at: u64,
    pub updated_at: u64,
    /// When `focused_step` was last set.
    #[serde(default)]
    pub focused_at: Option<u64>,
}

/// `user_id -> metas`, one meta per connection.
pub type PresenceList = BTreeMap<String, Vec<PresenceMeta>>;

/// Metas that appeared and disappeared. An update is a leave of the old
/// meta plus a join of the new one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceList,
    #[serde(default)]
    pub leaves: PresenceList,
}

impl PresenceDiff {
    fn join(meta: PresenceMeta) -> Self {
        let mut diff = Self::default();
        diff.joins.insert(meta.user.id.clone(), vec![meta]);
        diff
    }

    fn leave(meta: PresenceMeta) -> Self {
        let mut diff = Self::default();
        diff.leaves.insert(meta.user.id.clone(), vec![meta]);
        diff
    }

    fn update(old: PresenceMeta, new: PresenceMeta) -> Self {
        let mut diff = Self::leave(old);
        diff.joins.insert(new.user.id.clone(), vec![new]);
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable display color for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Derive a vivid color from the user id. The same id always maps to
    /// the same color, on every server and client.
    pub fn from_user_id(user_id: &str) -> Self {
        let hue = (fnv1a(user_id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

type WorkflowPresence = HashMap<String, Vec<PresenceMeta>>;

/// Presence of every workflow hosted by this server.
///
/// Each change is published as a `presence_diff` on the workflow topic and
/// returned to the caller.
pub struct PresenceTracker {
    workflows: RwLock<HashMap<Uuid, WorkflowPresence>>,
    rooms: Arc<RoomManager>,
}

impl PresenceTracker {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            rooms,
        }
    }

    /// Register a new connection of `user`.
    pub async fn track_user(&self, workflow_id: Uuid, user: UserInfo, conn_ref: ConnRef) -> PresenceDiff {
        let now = now_millis();
        let meta = PresenceMeta {
            conn_ref,
            user: user.into(),
            cursor: None,
            selected_steps: Vec::new(),
            focused_step: None,
            dragging_steps: Vec::new(),
            online_at: now,
            updated_at: now,
            focused_at: None,
        };
        log::info!("Presence: {} joined workflow {workflow_id} on {conn_ref}", meta.user.id);

        {
            let mut workflows = self.workflows.write().await;
            let metas = workflows
                .entry(workflow_id)
                .or_default()
                .entry(meta.user.id.clone())
                .or_default();
            metas.retain(|m| m.conn_ref != conn_ref);
            metas.push(meta.clone());
        }

        let diff = PresenceDiff::join(meta);
        self.publish(workflow_id, &diff).await;
        diff
    }

    /// Forget a connection. Returns `None` if it was not tracked.
    pub async fn untrack(&self, workflow_id: Uuid, conn_ref: ConnRef) -> Option<PresenceDiff> {
        let removed = {
            let mut workflows = self.workflows.write().await;
            let users = workflows.get_mut(&workflow_id)?;
            let (user_id, idx) = users.iter().find_map(|(user_id, metas)| {
                metas
                    .iter()
                    .position(|m| m.conn_ref == conn_ref)
                    .map(|idx| (user_id.clone(), idx))
            })?;

            let mut removed = None;
            if let Some(metas) = users.get_mut(&user_id) {
                removed = Some(metas.remove(idx));
                if metas.is_empty() {
                    users.remove(&user_id);
                }
            }
            if users.is_empty() {
                workflows.remove(&workflow_id);
            }
            removed?
        };

        log::info!("Presence: {} left workflow {workflow_id} from {conn_ref}", removed.user.id);
        let diff = PresenceDiff::leave(removed);
        self.publish(workflow_id, &diff).await;
        Some(diff)
    }

    pub async fn update_cursor(&self, workflow_id: Uuid, conn_ref: ConnRef, cursor: Option<Cursor>) -> Option<PresenceDiff> {
        log::trace!("Presence: cursor update on {conn_ref}");
        self.update_meta(workflow_id, conn_ref, |m| m.cursor = cursor).await
    }

    pub async fn update_selection(&self, workflow_id: Uuid, conn_ref: ConnRef, step_ids: Vec<String>) -> Option<PresenceDiff> {
        log::debug!("Presence: {conn_ref} selected {} steps", step_ids.len());
        self.update_meta(workflow_id, conn_ref, |m| m.selected_steps = step_ids).await
    }

    pub async fn update_focus(&self, workflow_id: Uuid, conn_ref: ConnRef, step_id: String) -> Option<PresenceDiff> {
        self.update_meta(workflow_id, conn_ref, |m| {
            if m.focused_step.as_deref() != Some(step_id.as_str()) {
                m.focused_step = Some(step_id);
                m.focused_at = Some(now_millis());
            }
        })
        .await
    }

    pub async fn clear_focus(&self, workflow_id: Uuid, conn_ref: ConnRef) -> Option<PresenceDiff> {
        self.update_meta(workflow_id, conn_ref, |m| {
            m.focused_step = None;
            m.focused_at = None;
        })
        .await
    }

    pub async fn update_dragging(&self, workflow_id: Uuid, conn_ref: ConnRef, step_ids: Vec<String>) -> Option<PresenceDiff> {
        self.update_meta(workflow_id, conn_ref, |m| m.dragging_steps = step_ids).await
    }

    /// Full `user_id -> [meta]` map of a workflow.
    pub async fn list_users(&self, workflow_id: Uuid) -> PresenceList {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .map(|users| users.iter().map(|(id, metas)| (id.clone(), metas.clone())).collect())
            .unwrap_or_default()
    }

    /// Connections `user_id` has open on a workflow.
    pub async fn connection_count(&self, workflow_id: Uuid, user_id: &str) -> usize {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .and_then(|users| users.get(user_id))
            .map_or(0, Vec::len)
    }

    pub async fn workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    /// Mutate the meta of `conn_ref`. Publishes leave+join when it changed.
    async fn update_meta<F>(&self, workflow_id: Uuid, conn_ref: ConnRef, f: F) -> Option<PresenceDiff>
    where
        F: FnOnce(&mut PresenceMeta),
    {
        let diff = {
            let mut workflows = self.workflows.write().await;
            let meta = workflows
                .get_mut(&workflow_id)?
                .values_mut()
                .flat_map(|metas| metas.iter_mut())
                .find(|m| m.conn_ref == conn_ref)?;

            let old = meta.clone();
            f(meta);
            if *meta == old {
                return None;
            }
            meta.updated_at = now_millis().max(old.updated_at + 1);
            PresenceDiff::update(old, meta.clone())
        };
        self.publish(workflow_id, &diff).await;
        Some(diff)
    }

    async fn publish(&self, workflow_id: Uuid, diff: &PresenceDiff) {
        if let Some(group) = self.rooms.get(Topic::Workflow(workflow_id)).await {
            group.publish(ServerMessage::PresenceDiff { diff: diff.clone() });
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// One row of the UI-facing presence list: a user with all their tabs
/// merged together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    pub color: String,
    pub cursor: Option<Cursor>,
    pub selected_steps: Vec<String>,
    pub focused_step: Option<String>,
    pub dragging_steps: Vec<String>,
    pub tab_count: usize,
    pub online_at: u64,
}

/// Client-side presence list, rebuilt wholesale from each fetched list.
#[derive(Debug, Clone, Default)]
pub struct PresenceView {
    /// User left out of the list, usually the local one.
    exclude_user: Option<String>,
    entries: Vec<PresenceEntry>,
    refetches: u64,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave `user_id` out of `entries()`.
    pub fn excluding(user_id: impl Into<String>) -> Self {
        Self {
            exclude_user: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Record a diff. The diff body is never merged: the caller refetches
    /// the full list and hands it to `apply_list`.
    pub fn handle_diff(&mut self, _diff: &PresenceDiff) {
        self.refetches += 1;
    }

    /// Replace the view with a freshly fetched list.
    pub fn apply_list(&mut self, list: &PresenceList) -> &[PresenceEntry] {
        self.entries = flatten(list, self.exclude_user.as_deref());
        &self.entries
    }

    pub fn entries(&self) -> &[PresenceEntry] {
        &self.entries
    }

    pub fn entry(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.iter().find(|e| e.user_id == user_id)
    }

    /// How many diffs asked for a refetch.
    pub fn refetch_count(&self) -> u64 {
        self.refetches
    }
}

/// Merge each user's metas into one entry.
///
/// The first meta supplies the profile, the most recently updated one the
/// cursor. Selections and drags are unioned across tabs. Focus comes from
/// the tab that focused most recently.
pub fn flatten(list: &PresenceList, exclude_user: Option<&str>) -> Vec<PresenceEntry> {
    list.iter()
        .filter(|(user_id, _)| Some(user_id.as_str()) != exclude_user)
        .filter_map(|(user_id, metas)| {
            let first = metas.first()?;
            let latest = metas.iter().max_by_key(|m| m.updated_at)?;
            let focused = metas
                .iter()
                .filter(|m| m.focused_step.is_some())
                .max_by_key(|m| m.focused_at.unwrap_or(0));

            let selected: BTreeSet<&String> = metas.iter().flat_map(|m| &m.selected_steps).collect();
            let dragging: BTreeSet<&String> = metas.iter().flat_map(|m| &m.dragging_steps).collect();

            Some(PresenceEntry {
                user_id: user_id.clone(),
                name: first.user.name.clone(),
                email: first.user.email.clone(),
                color: first.user.color.clone(),
                cursor: latest.cursor,
                selected_steps: selected.into_iter().cloned().collect(),
                focused_step: focused.and_then(|m| m.focused_step.clone()),
                dragging_steps: dragging.into_iter().cloned().collect(),
                tab_count: metas.len(),
                online_at: metas.iter().map(|m| m.online_at).min().unwrap_or(first.online_at),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<RoomManager>, PresenceTracker) {
        let rooms = Arc::new(RoomManager::new(64));
        (rooms.clone(), PresenceTracker::new(rooms))
    }

    #[test]
    fn user_color_is_stable_and_hex() {
        let a = UserColor::from_user_id("alice");
        assert_eq!(a, UserColor::from_user_id("alice"));
        let hex = a.hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
        assert_ne!(UserColor::from_user_id("alice"), UserColor::from_user_id("bob"));
    }

    #[test]
    fn hsl_primary_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-6);
        assert!(g.abs() < 1e-6);
        assert!(b.abs() < 1e-6);
    }

    #[tokio::test]
    async fn multi_tab_tracking() {
        let (_, tracker) = tracker();
        let wf = Uuid::new_v4();
        let tab1 = ConnRef::new();
        let tab2 = ConnRef::new();

        let diff = tracker.track_user(wf, UserInfo::new("u1", "Ann"), tab1).await;
        assert_eq!(diff.joins["u1"].len(), 1);
        assert!(diff.leaves.is_empty());
        tracker.track_user(wf, UserInfo::new("u1", "Ann"), tab2).await;
        tracker.track_user(wf, UserInfo::new("u2", "Ben"), ConnRef::new()).await;

        let list = tracker.list_users(wf).await;
        assert_eq!(list["u1"].len(), 2);
        assert_eq!(list["u2"].len(), 1);
        assert_eq!(tracker.connection_count(wf, "u1").await, 2);

        let left = tracker.untrack(wf, tab1).await.unwrap();
        assert_eq!(left.leaves["u1"][0].conn_ref, tab1);
        assert_eq!(tracker.connection_count(wf, "u1").await, 1);
        assert!(tracker.untrack(wf, tab1).await.is_none());
    }

    #[tokio::test]
    async fn updates_touch_only_own_meta_and_publish_leave_plus_join() {
        let (rooms, tracker) = tracker();
        let wf = Uuid::new_v4();
        let group = rooms.get_or_create(Topic::Workflow(wf)).await;
        let mut rx = group.subscribe();

        let tab1 = ConnRef::new();
        let tab2 = ConnRef::new();
        tracker.track_user(wf, UserInfo::new("u1", "Ann"), tab1).await;
        tracker.track_user(wf, UserInfo::new("u1", "Ann"), tab2).await;

        let diff = tracker.update_cursor(wf, tab2, Some(Cursor::new(10.0, 20.0))).await.unwrap();
        assert_eq!(diff.leaves["u1"][0].cursor, None);
        assert_eq!(diff.joins["u1"][0].cursor, Some(Cursor::new(10.0, 20.0)));

        let list = tracker.list_users(wf).await;
        let tab1_meta = list["u1"].iter().find(|m| m.conn_ref == tab1).unwrap();
        assert_eq!(tab1_meta.cursor, None);

        // Two joins then one update.
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert!(matches!(*msg, ServerMessage::PresenceDiff { .. }));
        }
    }

    #[tokio::test]
    async fn unchanged_update_produces_no_diff() {
        let (_, tracker) = tracker();
        let wf = Uuid::new_v4();
        let tab = ConnRef::new();
        tracker.track_user(wf, UserInfo::new("u1", "Ann"), tab).await;

        assert!(tracker.update_selection(wf, tab, vec!["a".into()]).await.is_some());
        assert!(tracker.update_selection(wf, tab, vec!["a".into()]).await.is_none());
        assert!(tracker.update_focus(wf, tab, "a".into()).await.is_some());
        assert!(tracker.update_focus(wf, tab, "a".into()).await.is_none());
        assert!(tracker.clear_focus(wf, tab).await.is_some());
        assert!(tracker.update_dragging(wf, ConnRef::new(), vec![]).await.is_none());
    }

    fn meta(user: &str, conn: ConnRef, updated_at: u64) -> PresenceMeta {
        PresenceMeta {
            conn_ref: conn,
            user: UserInfo::new(user, user.to_uppercase()).into(),
            cursor: None,
            selected_steps: vec![],
            focused_step: None,
            dragging_steps: vec![],
            online_at: updated_at,
            updated_at,
            focused_at: None,
        }
    }

    #[test]
    fn flatten_merges_tabs() {
        let mut tab1 = meta("u1", ConnRef::new(), 10);
        tab1.cursor = Some(Cursor::new(1.0, 1.0));
        tab1.selected_steps = vec!["b".into(), "a".into()];
        tab1.focused_step = Some("a".into());
        tab1.focused_at = Some(50);

        let mut tab2 = meta("u1", ConnRef::new(), 20);
        tab2.cursor = Some(Cursor::new(2.0, 2.0));
        tab2.selected_steps = vec!["a".into(), "c".into()];
        tab2.dragging_steps = vec!["c".into()];
        tab2.focused_step = Some("c".into());
        tab2.focused_at = Some(15);

        let mut list = PresenceList::new();
        list.insert("u1".into(), vec![tab1, tab2]);
        list.insert("u2".into(), vec![meta("u2", ConnRef::new(), 5)]);

        let entries = flatten(&list, None);
        assert_eq!(entries.len(), 2);
        let u1 = &entries[0];
        assert_eq!(u1.user_id, "u1");
        assert_eq!(u1.name, "U1");
        assert_eq!(u1.tab_count, 2);
        assert_eq!(u1.cursor, Some(Cursor::new(2.0, 2.0)));
        assert_eq!(u1.selected_steps, vec!["a", "b", "c"]);
        assert_eq!(u1.dragging_steps, vec!["c"]);
        assert_eq!(u1.focused_step.as_deref(), Some("a"));
        assert_eq!(u1.online_at, 10);

        let others = flatten(&list, Some("u1"));
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].user_id, "u2");
    }

    #[test]
    fn view_always_refetches_and_rebuilds() {
        let mut view = PresenceView::excluding("me");
        view.handle_diff(&PresenceDiff::default());
        view.handle_diff(&PresenceDiff::default());
        assert_eq!(view.refetch_count(), 2);

        let mut list = PresenceList::new();
        list.insert("me".into(), vec![meta("me", ConnRef::new(), 1)]);
        list.insert("u2".into(), vec![meta("u2", ConnRef::new(), 1)]);
        assert_eq!(view.apply_list(&list).len(), 1);
        assert!(view.entry("u2").is_some());

        list.remove("u2");
        assert!(view.apply_list(&list).is_empty());
    }
}
