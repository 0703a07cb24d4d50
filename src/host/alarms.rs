use super::{Alarm, AlarmListener, AlarmScheduler, EventListeners, ListenerHandle};
use crate::clock::Clock;
use crate::error::{PauseError, PauseResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct PendingAlarm {
    alarm: Alarm,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct AlarmTable {
    next_generation: u64,
    pending: HashMap<String, PendingAlarm>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    table: Mutex<AlarmTable>,
    on_alarm: EventListeners<Alarm>,
}

/// Alarm scheduler backed by tokio timers, one task per pending alarm.
/// Must be used from inside a tokio runtime.
#[derive(Clone)]
pub struct TokioAlarms {
    shared: Arc<Shared>,
}

impl TokioAlarms {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                table: Mutex::new(AlarmTable::default()),
                on_alarm: EventListeners::new(),
            }),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.shared.on_alarm.len()
    }

    fn lock_table(&self) -> PauseResult<std::sync::MutexGuard<'_, AlarmTable>> {
        self.shared
            .table
            .lock()
            .map_err(|e| PauseError::alarm(format!("Mutex poisoned: {}", e)))
    }
}

impl Shared {
    /// Fire only if the alarm was not replaced or cleared while the timer slept
    fn fire(&self, name: &str, generation: u64) {
        let alarm = {
            let mut table = match self.table.lock() {
                Ok(t) => t,
                Err(e) => {
                    error!("[ALARMS] Mutex poisoned, alarm '{}' dropped: {}", name, e);
                    return;
                }
            };
            match table.pending.get(name) {
                Some(p) if p.generation == generation => {}
                _ => return,
            }
            match table.pending.remove(name) {
                Some(p) => p.alarm,
                None => return,
            }
        };
        info!(
            "[ALARMS] Alarm '{}' fired (scheduled for {})",
            alarm.name, alarm.scheduled_time
        );
        self.on_alarm.dispatch(&alarm);
    }
}

impl AlarmScheduler for TokioAlarms {
    fn create(&self, name: &str, when: i64) -> PauseResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PauseError::alarm(format!("No tokio runtime: {}", e)))?;

        let delay_ms = when.saturating_sub(self.shared.clock.now_ms()).max(0) as u64;
        let mut table = self.lock_table()?;
        table.next_generation += 1;
        let generation = table.next_generation;

        let shared = self.shared.clone();
        let alarm_name = name.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            shared.fire(&alarm_name, generation);
        });

        let alarm = Alarm {
            name: name.to_string(),
            scheduled_time: when,
        };
        if let Some(previous) = table.pending.insert(
            name.to_string(),
            PendingAlarm {
                alarm,
                generation,
                task,
            },
        ) {
            previous.task.abort();
            debug!(
                "[ALARMS] Alarm '{}' replaced (was {}, now {})",
                name, previous.alarm.scheduled_time, when
            );
        }
        debug!("[ALARMS] Alarm '{}' armed, fires in {}ms", name, delay_ms);
        Ok(())
    }

    fn clear(&self, name: &str) -> bool {
        match self.lock_table() {
            Ok(mut table) => match table.pending.remove(name) {
                Some(pending) => {
                    pending.task.abort();
                    debug!("[ALARMS] Alarm '{}' cleared", name);
                    true
                }
                None => false,
            },
            Err(e) => {
                error!("[ALARMS] Failed to clear alarm '{}': {}", name, e);
                false
            }
        }
    }

    fn get(&self, name: &str) -> Option<Alarm> {
        self.lock_table()
            .ok()
            .and_then(|table| table.pending.get(name).map(|p| p.alarm.clone()))
    }

    fn get_all(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self
            .lock_table()
            .map(|table| table.pending.values().map(|p| p.alarm.clone()).collect())
            .unwrap_or_default();
        alarms.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time));
        alarms
    }

    fn on_alarm(&self, listener: AlarmListener) -> ListenerHandle {
        self.shared.on_alarm.add_listener(listener)
    }
}
