/// Message timeline of one conversation view
///
/// A reducer: the snapshot fetch, realtime insert/update events and the local
/// send path are all dispatched as [`TimelineAction`]s. Entries are kept
/// oldest first. Confirmed entries are never reordered; an optimistic entry
/// is replaced in place when its authoritative copy arrives.
use crate::attachments::Attachment;
use crate::types::{MessageRow, NewMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Identity of a timeline entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryId {
    /// Store-assigned message id
    Confirmed(String),
    /// Local temporary id of an unconfirmed send
    Pending(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: EntryId,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub client_key: Option<Uuid>,
}

/// What a renderer may show for an entry
#[derive(Debug, PartialEq)]
pub enum MessageBody<'a> {
    Tombstone,
    Visible {
        text: Option<&'a str>,
        attachments: &'a [Attachment],
    },
}

impl TimelineEntry {
    /// Provisional entry for a send that has not been confirmed yet
    pub fn optimistic(temp_id: i64, message: &NewMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::Pending(temp_id),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            created_at,
            deleted_at: None,
            client_key: message.client_key,
        }
    }

    fn confirmed(row: MessageRow) -> Self {
        let deleted = row.deleted_at.is_some();
        Self {
            id: EntryId::Confirmed(row.id),
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            // Tombstones keep nothing of the original message
            content: if deleted { String::new() } else { row.content },
            attachments: if deleted { Vec::new() } else { row.attachments },
            created_at: row.created_at,
            deleted_at: row.deleted_at,
            client_key: row.client_key,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.id, EntryId::Pending(_))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn confirmed_id(&self) -> Option<&str> {
        match &self.id {
            EntryId::Confirmed(id) => Some(id),
            EntryId::Pending(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<i64> {
        match self.id {
            EntryId::Pending(id) => Some(id),
            EntryId::Confirmed(_) => None,
        }
    }

    pub fn body(&self) -> MessageBody<'_> {
        if self.is_deleted() {
            return MessageBody::Tombstone;
        }
        MessageBody::Visible {
            text: Some(self.content.as_str()).filter(|t| !t.is_empty()),
            attachments: &self.attachments,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TimelineAction {
    /// Initial fetch, newest first as returned by the store
    Snapshot(Vec<MessageRow>),
    /// Authoritative insert (realtime event or the send call's own result)
    Inserted(MessageRow),
    /// Authoritative update, e.g. a soft delete
    Updated(MessageRow),
    /// Local send, shown before confirmation
    Optimistic(TimelineEntry),
    /// The send with this temporary id was rejected
    SendFailed { temp_id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Loaded(usize),
    Appended,
    Reconciled { temp_id: i64 },
    Replaced,
    Removed,
    Ignored,
}

pub struct Timeline {
    conversation_id: String,
    local_user_id: String,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(conversation_id: &str, local_user_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            local_user_id: local_user_id.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry with the given store id
    pub fn get(&self, message_id: &str) -> Option<&TimelineEntry> {
        self.position_of(message_id).map(|i| &self.entries[i])
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_optimistic()).count()
    }

    pub fn apply(&mut self, action: TimelineAction) -> Applied {
        match action {
            TimelineAction::Snapshot(rows) => self.load_snapshot(rows),
            TimelineAction::Inserted(row) => self.on_insert(row),
            TimelineAction::Updated(row) => self.on_update(row),
            TimelineAction::Optimistic(entry) => {
                if entry.conversation_id != self.conversation_id || !entry.is_optimistic() {
                    return Applied::Ignored;
                }
                self.entries.push(entry);
                Applied::Appended
            }
            TimelineAction::SendFailed { temp_id } => {
                let before = self.entries.len();
                self.entries.retain(|e| e.id != EntryId::Pending(temp_id));
                if self.entries.len() < before {
                    Applied::Removed
                } else {
                    Applied::Ignored
                }
            }
        }
    }

    /// Merge a history fetch into the timeline. Known ids are refreshed in
    /// place, unseen rows go after the newest confirmed entry, and entries
    /// older than the fetch window are kept.
    fn load_snapshot(&mut self, rows: Vec<MessageRow>) -> Applied {
        for row in rows.into_iter().rev() {
            if row.conversation_id != self.conversation_id {
                continue;
            }
            if let Some(index) = self.position_of(&row.id) {
                self.replace_at(index, row);
                continue;
            }

            // A send whose echo was missed is confirmed where it stands
            let pending = row.client_key.and_then(|key| {
                self.entries
                    .iter()
                    .position(|e| e.is_optimistic() && e.client_key == Some(key))
            });
            match pending {
                Some(index) => self.entries[index] = TimelineEntry::confirmed(row),
                None => {
                    let at = self
                        .entries
                        .iter()
                        .rposition(|e| !e.is_optimistic())
                        .map_or(0, |i| i + 1);
                    self.entries.insert(at, TimelineEntry::confirmed(row));
                }
            }
        }
        Applied::Loaded(self.len() - self.pending_count())
    }

    fn on_insert(&mut self, row: MessageRow) -> Applied {
        if row.conversation_id != self.conversation_id {
            return Applied::Ignored;
        }
        if self.position_of(&row.id).is_some() {
            debug!("Ignoring duplicate message {}", row.id);
            return Applied::Ignored;
        }

        if let Some(index) = self.find_optimistic_match(&row) {
            let temp_id = self.entries[index].temp_id().unwrap_or_default();
            self.entries[index] = TimelineEntry::confirmed(row);
            return Applied::Reconciled { temp_id };
        }

        self.entries.push(TimelineEntry::confirmed(row));
        Applied::Appended
    }

    fn on_update(&mut self, row: MessageRow) -> Applied {
        if row.conversation_id != self.conversation_id {
            return Applied::Ignored;
        }
        match self.position_of(&row.id) {
            Some(index) => {
                self.replace_at(index, row);
                Applied::Replaced
            }
            None => {
                self.entries.push(TimelineEntry::confirmed(row));
                Applied::Appended
            }
        }
    }

    fn replace_at(&mut self, index: usize, mut row: MessageRow) {
        // Soft deletes are final
        if row.deleted_at.is_none() {
            row.deleted_at = self.entries[index].deleted_at;
        }
        self.entries[index] = TimelineEntry::confirmed(row);
    }

    fn position_of(&self, message_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.confirmed_id() == Some(message_id))
    }

    /// Optimistic entry that `row` confirms, if any.
    ///
    /// The idempotency key decides when both sides carry one. Otherwise the
    /// oldest pending entry with equal content wins; for attachment-only
    /// messages the oldest pending entry with matching attachment presence.
    fn find_optimistic_match(&self, row: &MessageRow) -> Option<usize> {
        if row.sender_id != self.local_user_id {
            return None;
        }
        let mut pending = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_optimistic() && e.sender_id == row.sender_id);

        if let Some(key) = row.client_key {
            let keyed = pending
                .clone()
                .find(|(_, e)| e.client_key == Some(key))
                .map(|(i, _)| i);
            if keyed.is_some() {
                return keyed;
            }
            // Keyed echo of a send this view never made (another device)
            return pending
                .find(|(_, e)| e.client_key.is_none() && content_matches(e, row))
                .map(|(i, _)| i);
        }

        pending.find(|(_, e)| content_matches(e, row)).map(|(i, _)| i)
    }
}

fn content_matches(entry: &TimelineEntry, row: &MessageRow) -> bool {
    if row.content.is_empty() {
        entry.content.is_empty() && entry.attachments.is_empty() == row.attachments.is_empty()
    } else {
        entry.content == row.content
    }
}

/// Temporary ids for optimistic entries: wall-clock milliseconds, bumped when
/// two sends land in the same millisecond
#[derive(Debug, Default)]
pub struct TempIdClock {
    last: i64,
}

impl TempIdClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> i64 {
        self.next_at(Utc::now().timestamp_millis())
    }

    fn next_at(&mut self, now_millis: i64) -> i64 {
        let id = now_millis.max(self.last + 1);
        self.last = id;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentKind;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(id: &str, sender: &str, content: &str, secs: i64) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            receiver_id: None,
            content: content.to_string(),
            attachments: Vec::new(),
            created_at: at(secs),
            deleted_at: None,
            client_key: None,
        }
    }

    fn draft(content: &str, key: Option<Uuid>) -> NewMessage {
        NewMessage {
            conversation_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            receiver_id: Some("u2".to_string()),
            content: content.to_string(),
            attachments: Vec::new(),
            client_key: key,
        }
    }

    fn push_pending(timeline: &mut Timeline, temp_id: i64, message: &NewMessage) -> Applied {
        timeline.apply(TimelineAction::Optimistic(TimelineEntry::optimistic(
            temp_id,
            message,
            at(0),
        )))
    }

    fn image() -> Attachment {
        Attachment {
            kind: AttachmentKind::Image,
            url: "https://cdn/p.png".to_string(),
            name: "p.png".to_string(),
        }
    }

    #[test]
    fn test_echo_replaces_optimistic_entry() {
        let mut timeline = Timeline::new("c1", "u1");
        let entry = TimelineEntry::optimistic(1_700_000_000_000, &draft("hi", None), at(0));
        timeline.apply(TimelineAction::Optimistic(entry));

        let applied = timeline.apply(TimelineAction::Inserted(row("42", "u1", "hi", 1)));

        assert_eq!(applied, Applied::Reconciled { temp_id: 1_700_000_000_000 });
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].id, EntryId::Confirmed("42".to_string()));
        assert!(!timeline.entries()[0].is_optimistic());
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Inserted(row("1", "u2", "hey", 0)));
        let applied = timeline.apply(TimelineAction::Inserted(row("1", "u2", "hey", 0)));

        assert_eq!(applied, Applied::Ignored);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_reconcile_keeps_position() {
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Optimistic(TimelineEntry::optimistic(
            10,
            &draft("first", None),
            at(0),
        )));
        timeline.apply(TimelineAction::Inserted(row("5", "u2", "interleaved", 1)));
        timeline.apply(TimelineAction::Inserted(row("6", "u1", "first", 2)));

        let ids: Vec<_> = timeline.entries().iter().map(|e| e.confirmed_id()).collect();
        assert_eq!(ids, vec![Some("6"), Some("5")]);
    }

    #[test]
    fn test_client_key_wins_over_content() {
        let key_a = Uuid::new_v4();
        let key_b = Uuid::new_v4();
        let mut timeline = Timeline::new("c1", "u1");
        push_pending(&mut timeline, 1, &draft("same", Some(key_a)));
        push_pending(&mut timeline, 2, &draft("same", Some(key_b)));

        let mut echo = row("9", "u1", "same", 1);
        echo.client_key = Some(key_b);
        let applied = timeline.apply(TimelineAction::Inserted(echo));

        assert_eq!(applied, Applied::Reconciled { temp_id: 2 });
        assert_eq!(timeline.entries()[0].temp_id(), Some(1));
        assert_eq!(timeline.entries()[1].confirmed_id(), Some("9"));
    }

    #[test]
    fn test_keyed_echo_from_other_device_appends() {
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Optimistic(TimelineEntry::optimistic(
            1,
            &draft("same", Some(Uuid::new_v4())),
            at(0),
        )));

        let mut echo = row("9", "u1", "same", 1);
        echo.client_key = Some(Uuid::new_v4());
        assert_eq!(timeline.apply(TimelineAction::Inserted(echo)), Applied::Appended);
        assert_eq!(timeline.pending_count(), 1);
    }

    #[test]
    fn test_identical_unkeyed_sends_resolve_oldest_first() {
        let mut timeline = Timeline::new("c1", "u1");
        push_pending(&mut timeline, 1, &draft("lol", None));
        push_pending(&mut timeline, 2, &draft("lol", None));

        assert_eq!(
            timeline.apply(TimelineAction::Inserted(row("7", "u1", "lol", 1))),
            Applied::Reconciled { temp_id: 1 }
        );
        assert_eq!(
            timeline.apply(TimelineAction::Inserted(row("8", "u1", "lol", 1))),
            Applied::Reconciled { temp_id: 2 }
        );
        assert_eq!(timeline.pending_count(), 0);
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_attachment_only_match() {
        let mut timeline = Timeline::new("c1", "u1");
        let mut with_file = draft("", None);
        with_file.attachments.push(image());
        push_pending(&mut timeline, 3, &with_file);

        // Text echo from the same sender does not claim it
        timeline.apply(TimelineAction::Inserted(row("10", "u1", "other", 1)));
        assert_eq!(timeline.pending_count(), 1);

        let mut echo = row("11", "u1", "", 2);
        echo.attachments.push(image());
        assert_eq!(
            timeline.apply(TimelineAction::Inserted(echo)),
            Applied::Reconciled { temp_id: 3 }
        );
    }

    #[test]
    fn test_other_sender_never_reconciles() {
        let mut timeline = Timeline::new("c1", "u1");
        push_pending(&mut timeline, 1, &draft("hi", None));

        assert_eq!(
            timeline.apply(TimelineAction::Inserted(row("3", "u2", "hi", 1))),
            Applied::Appended
        );
        assert_eq!(timeline.pending_count(), 1);
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_soft_delete_tombstones() {
        let mut timeline = Timeline::new("c1", "u1");
        let mut original = row("42", "u1", "secret", 0);
        original.attachments.push(image());
        timeline.apply(TimelineAction::Inserted(original.clone()));

        let mut deleted = original.clone();
        deleted.deleted_at = Some(at(5));
        assert_eq!(timeline.apply(TimelineAction::Updated(deleted)), Applied::Replaced);

        let entry = timeline.get("42").unwrap();
        assert_eq!(entry.body(), MessageBody::Tombstone);
        assert!(entry.content.is_empty());
        assert!(entry.attachments.is_empty());

        // A stale update cannot bring the content back
        timeline.apply(TimelineAction::Updated(original));
        assert_eq!(timeline.get("42").unwrap().body(), MessageBody::Tombstone);
    }

    #[test]
    fn test_update_for_unknown_id_appends() {
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Inserted(row("1", "u2", "a", 0)));
        assert_eq!(
            timeline.apply(TimelineAction::Updated(row("2", "u2", "b", 1))),
            Applied::Appended
        );
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_send_failure_removes_only_that_entry() {
        let mut timeline = Timeline::new("c1", "u1");
        push_pending(&mut timeline, 1, &draft("a", None));
        push_pending(&mut timeline, 2, &draft("b", None));

        let failed = TimelineAction::SendFailed { temp_id: 1 };
        assert_eq!(timeline.apply(failed.clone()), Applied::Removed);
        assert_eq!(timeline.apply(failed), Applied::Ignored);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].temp_id(), Some(2));
    }

    #[test]
    fn test_snapshot_is_rendered_oldest_first() {
        let mut timeline = Timeline::new("c1", "u1");
        push_pending(&mut timeline, 9, &draft("pending", None));

        let newest_first = vec![
            row("3", "u2", "c", 3),
            row("2", "u1", "b", 2),
            row("1", "u2", "a", 1),
        ];
        assert_eq!(timeline.apply(TimelineAction::Snapshot(newest_first)), Applied::Loaded(3));

        let ids: Vec<_> = timeline.entries().iter().map(|e| e.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                EntryId::Confirmed("1".to_string()),
                EntryId::Confirmed("2".to_string()),
                EntryId::Confirmed("3".to_string()),
                EntryId::Pending(9),
            ]
        );
    }

    #[test]
    fn test_refresh_never_reorders_or_drops_confirmed() {
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Inserted(row("1", "u2", "old", 0)));
        push_pending(&mut timeline, 10, &draft("first", None));
        timeline.apply(TimelineAction::Inserted(row("5", "u2", "interleaved", 1)));
        timeline.apply(TimelineAction::Inserted(row("6", "u1", "first", 2)));

        // Window of two: "1" is outside it, "7" was missed while lagging
        let mut deleted = row("5", "u2", "interleaved", 1);
        deleted.deleted_at = Some(at(4));
        let newest_first = vec![
            row("7", "u2", "missed", 3),
            row("6", "u1", "first", 2),
            deleted,
        ];
        assert_eq!(timeline.apply(TimelineAction::Snapshot(newest_first)), Applied::Loaded(4));

        let ids: Vec<_> = timeline.entries().iter().map(|e| e.confirmed_id()).collect();
        assert_eq!(ids, vec![Some("1"), Some("6"), Some("5"), Some("7")]);
        assert!(timeline.get("5").unwrap().is_deleted());
    }

    #[test]
    fn test_refresh_confirms_keyed_send_in_place() {
        let key = Uuid::new_v4();
        let mut timeline = Timeline::new("c1", "u1");
        timeline.apply(TimelineAction::Inserted(row("1", "u2", "before", 0)));
        push_pending(&mut timeline, 10, &draft("mine", Some(key)));
        push_pending(&mut timeline, 11, &draft("still sending", None));

        let mut echo = row("2", "u1", "mine", 1);
        echo.client_key = Some(key);
        timeline.apply(TimelineAction::Snapshot(vec![echo, row("1", "u2", "before", 0)]));

        let ids: Vec<_> = timeline.entries().iter().map(|e| e.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                EntryId::Confirmed("1".to_string()),
                EntryId::Confirmed("2".to_string()),
                EntryId::Pending(11),
            ]
        );
    }

    #[test]
    fn test_other_conversation_is_ignored() {
        let mut timeline = Timeline::new("c1", "u1");
        let mut foreign = row("1", "u2", "x", 0);
        foreign.conversation_id = "c2".to_string();
        assert_eq!(timeline.apply(TimelineAction::Inserted(foreign)), Applied::Ignored);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_temp_ids_are_unique() {
        let mut clock = TempIdClock::new();
        assert_eq!(clock.next_at(1_000), 1_000);
        assert_eq!(clock.next_at(1_000), 1_001);
        assert_eq!(clock.next_at(999), 1_002);
        assert_eq!(clock.next_at(5_000), 5_000);
    }
}
