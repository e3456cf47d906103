//! Command queue, correlation tracking, and history.
//!
//! The queue holds three bounded priority lanes drained high-first with
//! age-based promotion: any queued command older than the starvation age
//! is taken next regardless of lane, so low-priority work cannot starve.
//! Active commands are correlated per device and finish on the earlier of
//! "all devices responded" and the command deadline.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use alicia_bus::Priority;
use alicia_core::{epoch_secs, AliciaError};

/// Default bound across all three lanes.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// History keeps at most this many finished commands, oldest evicted first.
pub const HISTORY_CAPACITY: usize = 1000;

/// Queued commands older than this are promoted ahead of higher lanes.
pub const STARVATION_AGE_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Executing,
    Completed,
    Timeout,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub command_id: String,
    pub device_ids: Vec<String>,
    pub command: String,
    pub parameters: Value,
    pub priority: Priority,
    pub queued_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    pub status: CommandStatus,
    /// device_id → response payload, filled as devices ack.
    pub responses: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Devices still expected to respond.
    #[serde(skip)]
    pending: HashSet<String>,
}

impl Command {
    pub fn new(device_ids: Vec<String>, command: String, parameters: Value, priority: Priority) -> Self {
        Self {
            command_id: format!("cmd_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            device_ids,
            command,
            parameters,
            priority,
            queued_at: epoch_secs(),
            started_at: None,
            completed_at: None,
            status: CommandStatus::Queued,
            responses: HashMap::new(),
            error: None,
            pending: HashSet::new(),
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────────

/// Three bounded lanes with age-based promotion.
pub struct CommandQueue {
    high: VecDeque<Command>,
    normal: VecDeque<Command>,
    low: VecDeque<Command>,
    capacity: usize,
    starvation_age: f64,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            capacity,
            starvation_age: STARVATION_AGE_SECS,
        }
    }

    #[cfg(test)]
    fn with_starvation_age(capacity: usize, starvation_age: f64) -> Self {
        Self {
            starvation_age,
            ..Self::new(capacity)
        }
    }

    /// Enqueue a command; `queue_full` when the shared bound is reached.
    pub fn push(&mut self, command: Command) -> Result<(), AliciaError> {
        if self.len() >= self.capacity {
            return Err(AliciaError::Overload("queue_full".into()));
        }
        match command.priority {
            Priority::High => self.high.push_back(command),
            Priority::Normal => self.normal.push_back(command),
            Priority::Low => self.low.push_back(command),
        }
        Ok(())
    }

    /// Take the next command: the oldest starving entry if any lane has
    /// one, otherwise strictly high → normal → low.
    pub fn pop(&mut self) -> Option<Command> {
        let now = epoch_secs();

        // Promotion pass: the oldest front entry past the starvation age
        // wins, regardless of its lane.
        let starving = [&self.low, &self.normal, &self.high]
            .iter()
            .filter_map(|lane| lane.front().map(|c| c.queued_at))
            .filter(|queued_at| now - queued_at > self.starvation_age)
            .fold(None::<f64>, |oldest, t| {
                Some(oldest.map_or(t, |o| o.min(t)))
            });

        if let Some(oldest) = starving {
            for lane in [&mut self.low, &mut self.normal, &mut self.high] {
                if lane.front().map(|c| c.queued_at == oldest).unwrap_or(false) {
                    return lane.pop_front();
                }
            }
        }

        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tracker ──────────────────────────────────────────────────────────

/// Active commands plus the bounded history of finished ones.
pub struct CommandTracker {
    active: HashMap<String, Command>,
    history: VecDeque<Command>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Move a command into execution, recording which devices were actually
    /// dispatched to. With an empty dispatch set the command completes
    /// immediately with no responses.
    pub fn start(&mut self, mut command: Command, dispatched: HashSet<String>) {
        let now = epoch_secs();
        command.started_at = Some(now);

        if dispatched.is_empty() {
            command.status = CommandStatus::Completed;
            command.completed_at = Some(now);
            info!(command = %command.command_id, "command completed (no target devices)");
            self.finish(command);
            return;
        }

        command.status = CommandStatus::Executing;
        command.pending = dispatched;
        self.active.insert(command.command_id.clone(), command);
    }

    /// Correlate a device response. Returns `true` when this response
    /// finished the command. Responses for unknown or already-finished
    /// commands are ignored.
    pub fn record_response(&mut self, command_id: &str, device_id: &str, response: Value) -> bool {
        let Some(command) = self.active.get_mut(command_id) else {
            return false;
        };
        if !command.pending.remove(device_id) {
            // Duplicate or unsolicited device ack.
            return false;
        }
        let failed = response
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "failed" || s == "error")
            .unwrap_or(false);
        command.responses.insert(device_id.to_string(), response);

        if failed {
            command.error = Some(format!("device {device_id} reported failure"));
        }

        if command.pending.is_empty() {
            let mut command = self.active.remove(command_id).expect("checked above");
            command.completed_at = Some(epoch_secs());
            command.status = if command.error.is_some() {
                CommandStatus::Failed
            } else {
                CommandStatus::Completed
            };
            info!(command = %command_id, status = ?command.status, "command finished");
            self.finish(command);
            true
        } else {
            false
        }
    }

    /// Deadline expiry: mark the command timed out (exactly once) and move
    /// it to history. Later responses for it are ignored.
    pub fn timeout(&mut self, command_id: &str) -> bool {
        let Some(mut command) = self.active.remove(command_id) else {
            return false;
        };
        command.status = CommandStatus::Timeout;
        command.error = Some("Command timeout".into());
        command.completed_at = Some(epoch_secs());
        warn!(
            command = %command_id,
            missing = command.pending.len(),
            "command timed out"
        );
        self.finish(command);
        true
    }

    fn finish(&mut self, command: Command) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(command);
    }

    /// Look up a command in the active table or history.
    pub fn get(&self, command_id: &str) -> Option<&Command> {
        self.active.get(command_id).or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|c| c.command_id == command_id)
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(priority: Priority) -> Command {
        Command::new(
            vec!["d1".into()],
            "on".into(),
            json!({}),
            priority,
        )
    }

    #[test]
    fn queue_drains_high_first() {
        let mut queue = CommandQueue::new(10);
        queue.push(command(Priority::Low)).unwrap();
        queue.push(command(Priority::Normal)).unwrap();
        queue.push(command(Priority::High)).unwrap();

        assert_eq!(queue.pop().unwrap().priority, Priority::High);
        assert_eq!(queue.pop().unwrap().priority, Priority::Normal);
        assert_eq!(queue.pop().unwrap().priority, Priority::Low);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn queue_bound_is_enforced() {
        let mut queue = CommandQueue::new(2);
        queue.push(command(Priority::Normal)).unwrap();
        queue.push(command(Priority::High)).unwrap();
        let err = queue.push(command(Priority::High)).unwrap_err();
        assert!(matches!(err, AliciaError::Overload(_)));
    }

    #[test]
    fn starving_low_priority_is_promoted() {
        let mut queue = CommandQueue::with_starvation_age(10, 5.0);

        let mut old_low = command(Priority::Low);
        old_low.queued_at = epoch_secs() - 10.0;
        let old_id = old_low.command_id.clone();
        queue.push(old_low).unwrap();
        queue.push(command(Priority::High)).unwrap();

        // The aged low-priority command jumps the high lane.
        assert_eq!(queue.pop().unwrap().command_id, old_id);
        assert_eq!(queue.pop().unwrap().priority, Priority::High);
    }

    #[test]
    fn all_responses_complete_a_command() {
        let mut tracker = CommandTracker::new();
        let cmd = Command::new(
            vec!["d1".into(), "d2".into()],
            "on".into(),
            json!({"brightness": 50}),
            Priority::Normal,
        );
        let id = cmd.command_id.clone();
        tracker.start(cmd, HashSet::from(["d1".to_string(), "d2".to_string()]));

        assert!(!tracker.record_response(&id, "d1", json!({"status": "ok"})));
        assert_eq!(tracker.get(&id).unwrap().status, CommandStatus::Executing);

        assert!(tracker.record_response(&id, "d2", json!({"status": "ok"})));
        let finished = tracker.get(&id).unwrap();
        assert_eq!(finished.status, CommandStatus::Completed);
        assert_eq!(finished.responses.len(), 2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn device_failure_marks_command_failed() {
        let mut tracker = CommandTracker::new();
        let cmd = command(Priority::Normal);
        let id = cmd.command_id.clone();
        tracker.start(cmd, HashSet::from(["d1".to_string()]));

        tracker.record_response(&id, "d1", json!({"status": "failed", "reason": "stuck"}));
        assert_eq!(tracker.get(&id).unwrap().status, CommandStatus::Failed);
    }

    #[test]
    fn empty_dispatch_completes_immediately() {
        let mut tracker = CommandTracker::new();
        let cmd = command(Priority::Normal);
        let id = cmd.command_id.clone();
        tracker.start(cmd, HashSet::new());

        let finished = tracker.get(&id).unwrap();
        assert_eq!(finished.status, CommandStatus::Completed);
        assert!(finished.responses.is_empty());
    }

    #[test]
    fn timeout_is_terminal_and_late_responses_ignored() {
        let mut tracker = CommandTracker::new();
        let cmd = command(Priority::Normal);
        let id = cmd.command_id.clone();
        tracker.start(cmd, HashSet::from(["d1".to_string()]));

        assert!(tracker.timeout(&id));
        assert_eq!(tracker.get(&id).unwrap().status, CommandStatus::Timeout);

        // Exactly once: a second expiry is a no-op, as is a late response.
        assert!(!tracker.timeout(&id));
        assert!(!tracker.record_response(&id, "d1", json!({"status": "ok"})));
        assert_eq!(tracker.get(&id).unwrap().status, CommandStatus::Timeout);
        assert_eq!(tracker.history_len(), 1);
    }

    #[test]
    fn duplicate_response_ignored() {
        let mut tracker = CommandTracker::new();
        let cmd = Command::new(
            vec!["d1".into(), "d2".into()],
            "on".into(),
            json!({}),
            Priority::Normal,
        );
        let id = cmd.command_id.clone();
        tracker.start(cmd, HashSet::from(["d1".to_string(), "d2".to_string()]));

        assert!(!tracker.record_response(&id, "d1", json!({"seq": 1})));
        assert!(!tracker.record_response(&id, "d1", json!({"seq": 2})));
        let command = tracker.get(&id).unwrap();
        assert_eq!(command.responses["d1"]["seq"], 1);
        assert_eq!(command.status, CommandStatus::Executing);
    }

    #[test]
    fn history_is_bounded() {
        let mut tracker = CommandTracker::new();
        for _ in 0..(HISTORY_CAPACITY + 5) {
            let cmd = command(Priority::Normal);
            tracker.start(cmd, HashSet::new());
        }
        assert_eq!(tracker.history_len(), HISTORY_CAPACITY);
    }
}
