//! Merges the raw message/progress stream into the list shown to the user.
//!
//! Non-progress messages keep their arrival order. Progress for a tool use is
//! grouped right after the message that issued it, one run per tool use id in
//! tool-block order, so ids never reorder relative to each other. Within a
//! run milestones accumulate and at most one live status trails them.

use std::collections::HashMap;

use crate::message::{ConversationMessage, ProgressEntry, StreamEvent};

#[derive(Debug)]
struct Run {
    entries: Vec<ProgressEntry>,
}

impl Run {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn place(&mut self, entry: ProgressEntry) {
        let live_tail = self.entries.last().is_some_and(|last| !last.persisted);
        match (entry.persisted, live_tail) {
            // A new milestone supersedes the live status before it.
            (true, true) => {
                self.entries.pop();
                self.entries.push(entry);
            }
            (false, true) => {
                if let Some(last) = self.entries.last_mut() {
                    *last = entry;
                }
            }
            (_, false) => self.entries.push(entry),
        }
    }
}

#[derive(Debug)]
struct Slot {
    /// `None` for progress whose tool use has not appeared in the stream.
    message: Option<ConversationMessage>,
    runs: Vec<Run>,
}

/// Reconcile `events` into display order.
///
/// For every tool use id the output holds each persisted entry that was fed
/// in, in order, followed by at most one transient entry (the latest).
pub fn reorder_messages(events: impl IntoIterator<Item = StreamEvent>) -> Vec<StreamEvent> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut runs_by_id: HashMap<String, (usize, usize)> = HashMap::new();

    for event in events {
        match event {
            StreamEvent::Message(message) => {
                let slot_index = slots.len();
                let mut runs = Vec::new();
                for id in message.tool_use_ids() {
                    match runs_by_id.get(id).copied() {
                        // Progress that raced ahead of its tool use moves under it.
                        Some((orphan, run)) if slots[orphan].message.is_none() => {
                            let adopted =
                                std::mem::replace(&mut slots[orphan].runs[run], Run::new());
                            runs_by_id.insert(id.to_string(), (slot_index, runs.len()));
                            runs.push(adopted);
                        }
                        Some(_) => {}
                        None => {
                            runs_by_id.insert(id.to_string(), (slot_index, runs.len()));
                            runs.push(Run::new());
                        }
                    }
                }
                slots.push(Slot {
                    message: Some(message),
                    runs,
                });
            }
            StreamEvent::Progress(entry) => {
                let (slot_index, run_index) = match runs_by_id.get(&entry.tool_use_id) {
                    Some(&location) => location,
                    None => {
                        let location = (slots.len(), 0);
                        runs_by_id.insert(entry.tool_use_id.clone(), location);
                        slots.push(Slot {
                            message: None,
                            runs: vec![Run::new()],
                        });
                        location
                    }
                };
                slots[slot_index].runs[run_index].place(entry);
            }
        }
    }

    let mut out = Vec::new();
    for slot in slots {
        if let Some(message) = slot.message {
            out.push(StreamEvent::Message(message));
        }
        for run in slot.runs {
            out.extend(run.entries.into_iter().map(StreamEvent::Progress));
        }
    }
    out
}
