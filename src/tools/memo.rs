//! Persistent reminder list shown on the memo page

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tracing::info;

use super::{object_schema, ToolError, ToolRegistry};
use crate::device::Services;
use crate::orchestrator::Scheduler;
use crate::store::{self, Reminder, MAX_REMINDERS};

/// Validate a reminder time label: empty, or `HH:MM` on a 24 h clock
pub fn parse_time_label(raw: &str) -> Result<String, ToolError> {
    let label = raw.trim();
    if label.is_empty() {
        return Ok(String::new());
    }

    let invalid = || ToolError::InvalidArgument {
        name: "time",
        reason: format!("'{label}' is not a 24-hour HH:MM time"),
    };
    let (hours, minutes) = label.split_once(':').ok_or_else(invalid)?;
    let two_digits = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(hours) || !two_digits(minutes) {
        return Err(invalid());
    }
    let (h, m): (u8, u8) = (
        hours.parse().map_err(|_| invalid())?,
        minutes.parse().map_err(|_| invalid())?,
    );
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(label.to_string())
}

pub struct MemoBook {
    services: Services,
    scheduler: Scheduler,
    /// Serialises load, change and save of the stored list
    edit: Mutex<()>,
}

impl MemoBook {
    pub fn new(services: Services, scheduler: Scheduler) -> Self {
        Self {
            services,
            scheduler,
            edit: Mutex::new(()),
        }
    }

    fn lock_edit(&self) -> MutexGuard<'_, ()> {
        self.edit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reminders(&self) -> Vec<Reminder> {
        store::load_reminders(self.services.settings.as_ref())
    }

    pub fn add(&self, content: &str, time: &str) -> Result<String, ToolError> {
        let time = parse_time_label(time)?;
        let _edit = self.lock_edit();
        let mut reminders = self.reminders();
        if reminders.len() >= MAX_REMINDERS {
            return Ok(format!(
                "Memo list is full (max {MAX_REMINDERS}), finish or clear some first"
            ));
        }

        reminders.push(Reminder {
            time,
            content: content.to_string(),
        });
        self.save(&reminders)?;
        info!(content, total = reminders.len(), "memo added");
        Ok(format!("Added memo: {content} ({} total)", reminders.len()))
    }

    pub fn list(&self) -> String {
        let reminders = self.reminders();
        if reminders.is_empty() {
            return "No memos".to_string();
        }

        let mut out = String::from("Memos:");
        for (i, reminder) in reminders.iter().enumerate() {
            out.push_str(&format!("\n{}. ", i + 1));
            if !reminder.time.is_empty() {
                out.push_str(&format!("[{}] ", reminder.time));
            }
            out.push_str(&reminder.content);
        }
        out
    }

    /// Remove the memo at the 1-based `index`
    pub fn done(&self, index: u64) -> Result<String, ToolError> {
        let _edit = self.lock_edit();
        let mut reminders = self.reminders();
        let count = reminders.len();
        let Some(slot) = usize::try_from(index)
            .ok()
            .filter(|i| (1..=count).contains(i))
        else {
            return Ok(format!("Invalid index, there are {count} memos"));
        };

        let removed = reminders.remove(slot - 1);
        self.save(&reminders)?;
        info!(content = %removed.content, "memo done");
        Ok(format!("Done: {}", removed.content))
    }

    pub fn clear(&self) -> Result<String, ToolError> {
        let _edit = self.lock_edit();
        store::clear_reminders(self.services.settings.as_ref())
            .map_err(|e| ToolError::Failed(format!("could not clear memos: {e}")))?;
        self.refresh(Vec::new());
        info!("memos cleared");
        Ok("All memos cleared".to_string())
    }

    fn save(&self, reminders: &[Reminder]) -> Result<(), ToolError> {
        store::save_reminders(self.services.settings.as_ref(), reminders)
            .map_err(|e| ToolError::Failed(format!("could not save memos: {e}")))?;
        self.refresh(reminders.to_vec());
        Ok(())
    }

    fn refresh(&self, reminders: Vec<Reminder>) {
        let display = Arc::clone(&self.services.display);
        self.scheduler.schedule(move || display.show_reminders(&reminders));
    }
}

pub(super) fn register(registry: &mut ToolRegistry, memo: Arc<MemoBook>) {
    let book = Arc::clone(&memo);
    registry.add(
        "self.memo.add",
        "Add a reminder or todo item. It stays on the device screen and survives reboot.\n\
         Args:\n  `content`: short memo text\n  \
         `time`: 24-hour `HH:MM` label, or empty when the memo has no time",
        object_schema(
            json!({
                "content": {"type": "string"},
                "time": {"type": "string", "default": ""},
            }),
            &["content"],
        ),
        move |args| book.add(args.str("content")?, args.opt_str("time")?.unwrap_or("")),
    );

    let book = Arc::clone(&memo);
    registry.add(
        "self.memo.list",
        "List all reminders and todos on the device",
        object_schema(json!({}), &[]),
        move |_| Ok(book.list()),
    );

    let book = Arc::clone(&memo);
    registry.add(
        "self.memo.done",
        "Mark a memo as done and remove it.\n\
         Args:\n  `index`: 1-based position; call self.memo.list first if unsure",
        object_schema(
            json!({"index": {"type": "integer", "minimum": 1, "maximum": MAX_REMINDERS}}),
            &["index"],
        ),
        move |args| book.done(args.u64("index")?),
    );

    registry.add(
        "self.memo.clear",
        "Remove every memo",
        object_schema(json!({}), &[]),
        move |_| memo.clear(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;
    use std::sync::Barrier;
    use std::thread;

    fn book(fakes: &Fakes) -> MemoBook {
        MemoBook::new(fakes.services(), fakes.scheduler.clone())
    }

    #[test]
    fn test_time_labels_are_strict() {
        assert_eq!(parse_time_label("").unwrap(), "");
        assert_eq!(parse_time_label(" 09:30 ").unwrap(), "09:30");
        assert_eq!(parse_time_label("23:59").unwrap(), "23:59");
        for bad in ["9:30", "24:00", "12:60", "tomorrow", "12:3", "12-30", "1230", "+1:30"] {
            assert!(parse_time_label(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_add_list_done_clear() {
        let fakes = Fakes::new();
        let memo = book(&fakes);

        assert_eq!(memo.list(), "No memos");
        assert_eq!(memo.add("Standup", "15:00").unwrap(), "Added memo: Standup (1 total)");
        assert_eq!(memo.add("Buy milk", "").unwrap(), "Added memo: Buy milk (2 total)");
        assert_eq!(memo.list(), "Memos:\n1. [15:00] Standup\n2. Buy milk");

        assert_eq!(memo.done(3).unwrap(), "Invalid index, there are 2 memos");
        assert_eq!(memo.done(0).unwrap(), "Invalid index, there are 2 memos");
        assert_eq!(memo.done(1).unwrap(), "Done: Standup");
        assert_eq!(memo.list(), "Memos:\n1. Buy milk");

        memo.clear().unwrap();
        assert!(memo.reminders().is_empty());

        fakes.scheduler.run_pending();
        assert_eq!(
            fakes.display.calls(),
            vec!["reminders:1", "reminders:2", "reminders:1", "reminders:0"]
        );
    }

    #[test]
    fn test_bad_time_is_not_stored() {
        let fakes = Fakes::new();
        let memo = book(&fakes);
        assert!(memo.add("Call mom", "7pm").is_err());
        assert!(memo.reminders().is_empty());
    }

    #[test]
    fn test_list_is_capped() {
        let fakes = Fakes::new();
        let memo = book(&fakes);
        for i in 0..MAX_REMINDERS {
            memo.add(&format!("item {i}"), "").unwrap();
        }
        let reply = memo.add("one more", "").unwrap();
        assert!(reply.starts_with("Memo list is full"));
        assert_eq!(memo.reminders().len(), MAX_REMINDERS);
    }

    #[test]
    fn test_concurrent_adds_are_all_kept() {
        let fakes = Fakes::new();
        let memo = book(&fakes);
        let writers = 5;

        for round in 0..50 {
            memo.clear().unwrap();
            let barrier = Barrier::new(writers);
            thread::scope(|scope| {
                for i in 0..writers {
                    let (memo, barrier) = (&memo, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        memo.add(&format!("round {round} item {i}"), "").unwrap();
                    });
                }
            });
            assert_eq!(memo.reminders().len(), writers, "round {round} lost a memo");
        }
    }

    #[test]
    fn test_concurrent_adds_respect_cap() {
        let fakes = Fakes::new();
        let memo = book(&fakes);
        for i in 0..MAX_REMINDERS - 1 {
            memo.add(&format!("item {i}"), "").unwrap();
        }

        let barrier = Barrier::new(4);
        thread::scope(|scope| {
            for i in 0..4 {
                let (memo, barrier) = (&memo, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    memo.add(&format!("late {i}"), "").unwrap();
                });
            }
        });
        assert_eq!(memo.reminders().len(), MAX_REMINDERS);
    }

    #[test]
    fn test_registered_tools() {
        let fakes = Fakes::new();
        let mut registry = ToolRegistry::new();
        register(&mut registry, Arc::new(book(&fakes)));

        let reply = registry
            .call("self.memo.add", &json!({"content": "Gym", "time": "07:00"}))
            .unwrap();
        assert_eq!(reply, "Added memo: Gym (1 total)");
        assert!(registry.call("self.memo.add", &json!({"content": "Gym", "time": "7"})).is_err());
        assert_eq!(registry.call("self.memo.done", &json!({"index": "1"})).unwrap(), "Done: Gym");
    }
}
