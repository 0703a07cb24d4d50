use crate::clock::MockClock;
use crate::settings::tests::FlakyBackend;
use crate::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================
    // FIXTURES
    // ============================================

    type Seen = Arc<Mutex<Vec<Notification>>>;

    fn expires_update(value: i64) -> Notification {
        Notification::SettingUpdated(SettingUpdate::new(
            SettingsName::ProtectionPauseExpires,
            value,
        ))
    }

    fn enabled_update(value: bool) -> Notification {
        Notification::SettingUpdated(SettingUpdate::new(SettingsName::ProtectionEnabled, value))
    }

    fn seeded_backend(entries: &[(&str, &str)]) -> Arc<FlakyBackend> {
        let backend = Arc::new(FlakyBackend::default());
        {
            let mut saved = backend.saved.lock().unwrap();
            for (key, value) in entries {
                saved.insert(key.to_string(), value.to_string());
            }
        }
        backend
    }

    fn record(notifier: &Notifier) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.add_listener([NotifierEvent::SettingUpdated], move |n| {
            sink.lock().unwrap().push(n.clone())
        });
        seen
    }

    fn drain(port: &mut Port) -> Vec<Notification> {
        std::iter::from_fn(|| port.try_recv())
            .map(|e| Notification::from_envelope(&e).unwrap())
            .collect()
    }

    /// Controller wired to in-process host stand-ins, without the event loop
    struct Controller {
        clock: Arc<MockClock>,
        alarms: TokioAlarms,
        tabs: Arc<Tabs>,
        settings: Arc<SettingsStore>,
        seen: Seen,
        pause: ProtectionPause,
        host_rx: mpsc::UnboundedReceiver<HostEvent>,
    }

    impl Controller {
        fn new(now_ms: i64, backend: Arc<dyn SettingsBackend>) -> Self {
            Self::with_alarms(now_ms, backend, |alarms| Arc::new(alarms))
        }

        fn with_alarms(
            now_ms: i64,
            backend: Arc<dyn SettingsBackend>,
            scheduler: impl FnOnce(TokioAlarms) -> Arc<dyn AlarmScheduler>,
        ) -> Self {
            let clock = Arc::new(MockClock::starting_at(now_ms));
            let alarms = TokioAlarms::new(clock.clone());
            let tabs = Arc::new(Tabs::new());
            let settings = Arc::new(SettingsStore::open(backend).unwrap());
            let notifier = Arc::new(Notifier::new());
            let seen = record(&notifier);
            let (host_tx, host_rx) = mpsc::unbounded_channel();
            let scheduler = scheduler(alarms.clone());
            let pause = ProtectionPause::new(
                settings.clone(),
                scheduler,
                tabs.clone(),
                notifier,
                clock.clone(),
                host_tx,
            );
            Self {
                clock,
                alarms,
                tabs,
                settings,
                seen,
                pause,
                host_rx,
            }
        }

        fn take_seen(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }

        /// Wait for the next host event and hand it to the controller
        async fn pump_host_event(&mut self) -> bool {
            let event = self.host_rx.recv().await.unwrap();
            self.pause.handle_host_event(&event).await.unwrap()
        }
    }

    /// Full background process on a paused tokio clock
    struct Harness {
        clock: Arc<MockClock>,
        alarms: TokioAlarms,
        tabs: Arc<Tabs>,
        settings: Arc<SettingsStore>,
        notifier: Arc<Notifier>,
        handle: BackgroundHandle,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(now_ms: i64, backend: Arc<dyn SettingsBackend>, resync_on_startup: bool) -> Self {
            let clock = Arc::new(MockClock::starting_at(now_ms));
            let alarms = TokioAlarms::new(clock.clone());
            let tabs = Arc::new(Tabs::new());
            let settings = Arc::new(SettingsStore::open(backend).unwrap());
            let config = BackgroundConfig {
                resync_on_startup,
                ..BackgroundConfig::default()
            };
            let background = Background::new(
                settings.clone(),
                Arc::new(alarms.clone()),
                tabs.clone(),
                clock.clone(),
                config,
            );
            let notifier = background.notifier();
            let (handle, task) = background.spawn().unwrap();
            Self {
                clock,
                alarms,
                tabs,
                settings,
                notifier,
                handle,
                task,
            }
        }

        fn fresh(now_ms: i64) -> Self {
            Self::start(now_ms, Arc::new(Database::open_in_memory().unwrap()), true)
        }

        /// Round-trip through the event loop: everything queued before has
        /// been handled once this returns
        async fn popup_data(&self) -> Value {
            self.handle
                .send_message(Message::GetPopupData)
                .await
                .unwrap()
        }

        async fn status(&self) -> PauseStatus {
            serde_json::from_value(self.popup_data().await["pause"].clone()).unwrap()
        }

        async fn pause_for(&self, duration_ms: u64) -> i64 {
            self.handle
                .send_message(Message::SetPauseExpires(PauseRequest::for_duration(
                    duration_ms,
                )))
                .await
                .unwrap()
                .as_i64()
                .unwrap()
        }

        async fn stop(self) {
            self.handle.shutdown().unwrap();
            self.task.await.unwrap();
        }
    }

    /// Scheduler that accepts `successes` registrations and rejects the rest.
    /// A rejection can also break the settings backend.
    struct FailingAlarms {
        inner: TokioAlarms,
        successes: usize,
        created: AtomicUsize,
        break_writes: Option<Arc<FlakyBackend>>,
    }

    impl FailingAlarms {
        fn new(inner: TokioAlarms, successes: usize, break_writes: Option<Arc<FlakyBackend>>) -> Self {
            Self {
                inner,
                successes,
                created: AtomicUsize::new(0),
                break_writes,
            }
        }
    }

    impl AlarmScheduler for FailingAlarms {
        fn create(&self, name: &str, when: i64) -> PauseResult<()> {
            if self.created.fetch_add(1, Ordering::SeqCst) >= self.successes {
                if let Some(backend) = &self.break_writes {
                    backend.fail_writes.store(true, Ordering::SeqCst);
                }
                return Err(PauseError::alarm("alarm quota exceeded"));
            }
            self.inner.create(name, when)
        }

        fn clear(&self, name: &str) -> bool {
            self.inner.clear(name)
        }

        fn get(&self, name: &str) -> Option<Alarm> {
            self.inner.get(name)
        }

        fn get_all(&self) -> Vec<Alarm> {
            self.inner.get_all()
        }

        fn on_alarm(&self, listener: AlarmListener) -> ListenerHandle {
            self.inner.on_alarm(listener)
        }
    }

    // ============================================
    // PAUSE CONTROLLER
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn test_pause_expiry_within_requested_range() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));

        for duration in [1u64, 1_000, 30_000, 86_400_000] {
            let before = c.clock.now_ms();
            let expires = c.pause.pause(duration).await.unwrap();
            let stored = c.settings.protection_pause_expires();

            assert_eq!(stored, expires);
            assert!(stored != 0);
            assert!(stored >= before && stored <= before + duration as i64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_rejected() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));
        let err = c.pause.pause(0).await.unwrap_err();
        assert!(matches!(err, PauseError::InvalidDuration(0)));
        assert!(!c.pause.is_paused());
        assert_eq!(c.settings.protection_pause_expires(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_pause_keeps_one_alarm() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));

        c.pause.pause(30_000).await.unwrap();
        tokio::time::advance(Duration::from_millis(2_000)).await;
        c.pause.pause(10_000).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let last = c.pause.pause(60_000).await.unwrap();

        let pending = c.alarms.get_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, PAUSE_ALARM_NAME);
        assert_eq!(pending[0].scheduled_time, last);
        // Слушатели не накапливаются при повторной паузе
        assert_eq!(c.alarms.listener_count(), 1);
        assert_eq!(c.tabs.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_alarm_fires_at_deadline() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));

        let expires = c.pause.pause(30_000).await.unwrap();
        assert_eq!(expires, 31_000);
        assert_eq!(c.alarms.get(PAUSE_ALARM_NAME).unwrap().scheduled_time, 31_000);
        assert_eq!(c.take_seen(), vec![expires_update(31_000)]);
        assert!(!c.settings.is_protection_active(c.clock.now_ms()));

        // Время само продвигается до срабатывания будильника
        assert!(c.pump_host_event().await);
        assert!(c.clock.now_ms() >= 31_000);

        assert!(c.settings.protection_enabled());
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert_eq!(c.take_seen(), vec![expires_update(0)]);
        assert!(!c.pause.is_paused());
        assert_eq!(c.alarms.listener_count(), 0);
        assert_eq!(c.tabs.listener_count(), 0);
        assert!(c.alarms.get(PAUSE_ALARM_NAME).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_reenables_disabled_protection() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));
        c.settings.set_protection(false).await.unwrap();

        c.pause.pause(30_000).await.unwrap();
        c.take_seen();
        assert!(c.pump_host_event().await);

        assert_eq!(c.take_seen(), vec![expires_update(0), enabled_update(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_resume_cancels_alarm() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));

        c.pause.pause(30_000).await.unwrap();
        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert_eq!(c.clock.now_ms(), 5_000);

        c.pause.resume().await.unwrap();
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert!(c.settings.protection_enabled());
        assert!(c.alarms.get(PAUSE_ALARM_NAME).is_none());
        assert_eq!(c.alarms.listener_count(), 0);
        assert_eq!(c.tabs.listener_count(), 0);
        assert_eq!(
            c.take_seen(),
            vec![expires_update(31_000), expires_update(0)]
        );

        // Запоздалое срабатывание исходного будильника ничего не меняет
        let late = Alarm {
            name: PAUSE_ALARM_NAME.to_string(),
            scheduled_time: 31_000,
        };
        tokio::time::advance(Duration::from_millis(26_000)).await;
        assert!(!c.pause.on_alarm_fired(&late).await.unwrap());
        assert!(c.host_rx.try_recv().is_err());
        assert!(c.take_seen().is_empty());
        assert_eq!(c.settings.protection_pause_expires(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_foreign_alarms_ignored() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));
        c.pause.pause(30_000).await.unwrap();
        c.take_seen();

        let stale = Alarm {
            name: PAUSE_ALARM_NAME.to_string(),
            scheduled_time: 11_000,
        };
        let foreign = Alarm {
            name: "filters-update".to_string(),
            scheduled_time: 31_000,
        };
        assert!(!c.pause.on_alarm_fired(&stale).await.unwrap());
        assert!(!c.pause.on_alarm_fired(&foreign).await.unwrap());
        assert!(c.pause.is_paused());
        assert_eq!(c.settings.protection_pause_expires(), 31_000);
        assert!(c.take_seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_resync_is_idempotent() {
        let mut c = Controller::new(10_000, Arc::new(FlakyBackend::default()));
        c.settings.set_protection_pause_expires(500).await.unwrap();

        let navigation = TabUpdate {
            tab_id: 3,
            status: TabStatus::Complete,
        };
        assert!(c.pause.on_page_navigation(&navigation).await.unwrap());
        for _ in 0..3 {
            assert!(!c.pause.on_page_navigation(&navigation).await.unwrap());
            assert_eq!(c.settings.protection_pause_expires(), 0);
        }
        assert_eq!(c.take_seen(), vec![expires_update(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_before_deadline_keeps_pause() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));
        c.pause.pause(30_000).await.unwrap();

        c.tabs.notify_updated(1, TabStatus::Loading);
        let event = c.host_rx.try_recv().unwrap();
        assert!(!c.pause.handle_host_event(&event).await.unwrap());
        assert!(c.pause.is_paused());

        // Прочие статусы вкладки слушатель не пересылает
        c.tabs.notify_updated(1, TabStatus::Other("unloaded".into()));
        assert!(c.host_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_rejects_pause() {
        let backend = Arc::new(FlakyBackend::default());
        let mut c = Controller::new(1_000, backend.clone());
        backend.fail_writes.store(true, Ordering::SeqCst);

        let err = c.pause.pause(30_000).await.unwrap_err();
        assert!(matches!(err, PauseError::Storage(_)));
        assert!(!c.pause.is_paused());
        assert!(c.alarms.get_all().is_empty());
        assert_eq!(c.tabs.listener_count(), 0);
        assert!(c.take_seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_completion_keeps_navigation_retry() {
        let backend = Arc::new(FlakyBackend::default());
        let mut c = Controller::new(1_000, backend.clone());
        c.pause.pause(30_000).await.unwrap();
        backend.fail_writes.store(true, Ordering::SeqCst);

        let event = c.host_rx.recv().await.unwrap();
        assert!(c.pause.handle_host_event(&event).await.is_err());
        assert!(c.pause.is_paused());
        assert_eq!(c.tabs.listener_count(), 1);

        // Запись снова работает: первая навигация завершает паузу
        backend.fail_writes.store(false, Ordering::SeqCst);
        c.tabs.notify_updated(2, TabStatus::Complete);
        assert!(c.pump_host_event().await);
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert!(!c.pause.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_failure_rolls_back_expiry() {
        let mut c = Controller::with_alarms(
            1_000,
            Arc::new(FlakyBackend::default()),
            |alarms| Arc::new(FailingAlarms::new(alarms, 0, None)),
        );

        let err = c.pause.pause(30_000).await.unwrap_err();
        assert!(matches!(err, PauseError::Alarm(_)));
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert!(!c.pause.is_paused());
        assert!(c.take_seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_repause_write_keeps_previous_pause() {
        let backend = Arc::new(FlakyBackend::default());
        let mut c = Controller::new(1_000, backend.clone());
        c.pause.pause(30_000).await.unwrap();
        c.take_seen();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let err = c.pause.pause(60_000).await.unwrap_err();
        assert!(matches!(err, PauseError::Storage(_)));

        // Прежняя пауза не тронута: срок, будильник и слушатели на месте
        assert_eq!(
            c.pause.status(),
            PauseStatus::Paused {
                expires: 31_000,
                alarm_armed: true
            }
        );
        assert_eq!(c.settings.protection_pause_expires(), 31_000);
        assert_eq!(c.alarms.get(PAUSE_ALARM_NAME).unwrap().scheduled_time, 31_000);
        assert_eq!(c.alarms.listener_count(), 1);
        assert_eq!(c.tabs.listener_count(), 1);
        assert!(c.take_seen().is_empty());

        backend.fail_writes.store(false, Ordering::SeqCst);
        assert!(c.pump_host_event().await);
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert_eq!(c.pause.status(), PauseStatus::Active);
        assert_eq!(c.take_seen(), vec![expires_update(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repause_alarm_failure_keeps_previous_pause() {
        let mut c = Controller::with_alarms(1_000, Arc::new(FlakyBackend::default()), |alarms| {
            Arc::new(FailingAlarms::new(alarms, 1, None))
        });
        c.pause.pause(30_000).await.unwrap();
        c.take_seen();

        let err = c.pause.pause(60_000).await.unwrap_err();
        assert!(matches!(err, PauseError::Alarm(_)));
        assert_eq!(c.settings.protection_pause_expires(), 31_000);
        assert_eq!(
            c.pause.status(),
            PauseStatus::Paused {
                expires: 31_000,
                alarm_armed: true
            }
        );
        assert_eq!(c.alarms.get(PAUSE_ALARM_NAME).unwrap().scheduled_time, 31_000);
        assert!(c.take_seen().is_empty());

        assert!(c.pump_host_event().await);
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert_eq!(c.take_seen(), vec![expires_update(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrestorable_expiry_waits_for_navigation() {
        let backend = Arc::new(FlakyBackend::default());
        let failing = backend.clone();
        let mut c = Controller::with_alarms(1_000, backend.clone(), move |alarms| {
            Arc::new(FailingAlarms::new(alarms, 0, Some(failing)))
        });

        let err = c.pause.pause(30_000).await.unwrap_err();
        assert!(matches!(err, PauseError::Alarm(_)));
        assert_eq!(c.settings.protection_pause_expires(), 31_000);
        assert_eq!(
            c.pause.status(),
            PauseStatus::Paused {
                expires: 31_000,
                alarm_armed: false
            }
        );
        assert_eq!(c.tabs.listener_count(), 1);

        backend.fail_writes.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(30_000)).await;
        c.tabs.notify_updated(1, TabStatus::Complete);
        assert!(c.pump_host_event().await);
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert_eq!(c.pause.status(), PauseStatus::Active);
        assert_eq!(c.take_seen(), vec![expires_update(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rearms_future_pause() {
        let backend = seeded_backend(&[("protection-pause-expires", "31000")]);
        let mut c = Controller::new(1_000, backend);

        c.pause.restore(true).await.unwrap();
        assert_eq!(
            c.pause.status(),
            PauseStatus::Paused {
                expires: 31_000,
                alarm_armed: true
            }
        );
        assert!(c.pump_host_event().await);
        assert_eq!(c.settings.protection_pause_expires(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_completes_overdue_pause() {
        let backend = seeded_backend(&[
            ("protection-pause-expires", "500"),
            ("protection-enabled", "false"),
        ]);
        let mut c = Controller::new(10_000, backend);

        c.pause.restore(true).await.unwrap();
        assert_eq!(c.pause.status(), PauseStatus::Active);
        assert_eq!(c.settings.protection_pause_expires(), 0);
        assert!(c.settings.protection_enabled());
        assert_eq!(c.take_seen(), vec![expires_update(0), enabled_update(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_keeps_alarm_and_expiry() {
        let mut c = Controller::new(1_000, Arc::new(FlakyBackend::default()));
        c.pause.pause(30_000).await.unwrap();

        c.pause.teardown();
        assert!(!c.pause.is_paused());
        assert_eq!(c.alarms.listener_count(), 0);
        assert_eq!(c.tabs.listener_count(), 0);
        assert!(c.alarms.get(PAUSE_ALARM_NAME).is_some());
        assert_eq!(c.settings.protection_pause_expires(), 31_000);
    }

    // ============================================
    // BACKGROUND EVENT LOOP
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn test_pause_fans_out_once_per_connection() {
        let h = Harness::fresh(1_000);
        let mut ports: Vec<Port> = (0..3)
            .map(|i| {
                let name = if i == 0 { "popup" } else { "options" };
                h.handle
                    .subscribe(name, &[NotifierEvent::SettingUpdated])
                    .unwrap()
            })
            .collect();

        let expires = h.pause_for(30_000).await;
        assert_eq!(expires, 31_000);

        for port in ports.iter_mut() {
            assert_eq!(drain(port), vec![expires_update(31_000)]);
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_alarm_fires_through_background() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();

        h.pause_for(30_000).await;
        assert_eq!(drain(&mut popup), vec![expires_update(31_000)]);
        assert_eq!(
            h.status().await,
            PauseStatus::Paused {
                expires: 31_000,
                alarm_armed: true
            }
        );

        let envelope = popup.recv().await.unwrap();
        assert_eq!(
            Notification::from_envelope(&envelope).unwrap(),
            expires_update(0)
        );
        assert!(h.clock.now_ms() >= 31_000);
        assert_eq!(h.status().await, PauseStatus::Active);
        assert!(h.settings.protection_enabled());
        assert_eq!(h.alarms.listener_count(), 0);
        assert_eq!(h.tabs.listener_count(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_then_deadline_broadcasts_nothing() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();

        h.pause_for(30_000).await;
        tokio::time::advance(Duration::from_millis(4_000)).await;
        h.handle
            .send_message(Message::RemoveProtectionPauseTimer)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut popup),
            vec![expires_update(31_000), expires_update(0)]
        );

        tokio::time::sleep(Duration::from_millis(40_000)).await;
        assert_eq!(h.status().await, PauseStatus::Active);
        assert!(drain(&mut popup).is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_with_overdue_pause_waits_for_navigation() {
        let backend = seeded_backend(&[("protection-pause-expires", "500")]);
        let h = Harness::start(10_000, backend, false);

        assert_eq!(
            h.status().await,
            PauseStatus::Paused {
                expires: 500,
                alarm_armed: false
            }
        );
        assert!(h.alarms.get_all().is_empty());
        assert_eq!(h.tabs.listener_count(), 1);

        h.tabs.notify_updated(4, TabStatus::Loading);
        assert_eq!(h.status().await, PauseStatus::Active);
        assert_eq!(h.settings.protection_pause_expires(), 0);
        assert!(h.alarms.get_all().is_empty());
        assert_eq!(h.tabs.listener_count(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_message_type_rejected() {
        let h = Harness::fresh(1_000);
        let err = h
            .handle
            .send_envelope(&Envelope::empty("GET_CSS"))
            .await
            .unwrap_err();
        assert!(err.is_protocol());

        let err = h
            .handle
            .send_message(Message::AddLongLivedConnection(ConnectionRequest {
                events: vec![NotifierEvent::SettingUpdated],
            }))
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_port_message_closes_port() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();
        h.popup_data().await;
        assert_eq!(h.notifier.subscriber_count(), 1);

        popup.post_message(Envelope::empty("GET_CSS")).unwrap();
        assert!(popup.recv().await.is_none());
        assert_eq!(h.notifier.subscriber_count(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_port_is_unsubscribed() {
        let h = Harness::fresh(1_000);
        let popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();
        let mut options = h
            .handle
            .subscribe("options", &[NotifierEvent::SettingUpdated])
            .unwrap();
        h.popup_data().await;
        assert_eq!(h.notifier.subscriber_count(), 2);

        drop(popup);
        h.pause_for(30_000).await;
        assert_eq!(h.notifier.subscriber_count(), 1);
        assert_eq!(drain(&mut options), vec![expires_update(31_000)]);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_replaces_interest_set() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();
        popup
            .post(&Message::AddLongLivedConnection(ConnectionRequest {
                events: vec![NotifierEvent::SettingUpdated],
            }))
            .unwrap();

        h.pause_for(30_000).await;
        assert_eq!(h.notifier.subscriber_count(), 1);
        assert_eq!(drain(&mut popup).len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_setting_broadcasts_only_changes() {
        let h = Harness::fresh(1_000);
        let mut options = h
            .handle
            .subscribe("options", &[NotifierEvent::SettingUpdated])
            .unwrap();
        let update = SettingUpdate::new(SettingsName::WizardEnabled, false);

        for _ in 0..2 {
            h.handle
                .send_message(Message::SetSetting(update.clone()))
                .await
                .unwrap();
        }
        assert_eq!(
            drain(&mut options),
            vec![Notification::SettingUpdated(update)]
        );

        let err = h
            .handle
            .send_message(Message::SetSetting(SettingUpdate::new(
                SettingsName::WizardEnabled,
                "no",
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, PauseError::InvalidSetting(_)));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_setting_goes_through_controller() {
        let h = Harness::fresh(1_000);

        h.handle
            .send_message(Message::SetSetting(SettingUpdate::new(
                SettingsName::ProtectionPauseExpires,
                20_000,
            )))
            .await
            .unwrap();
        assert_eq!(
            h.status().await,
            PauseStatus::Paused {
                expires: 20_000,
                alarm_armed: true
            }
        );
        assert_eq!(h.alarms.get(PAUSE_ALARM_NAME).unwrap().scheduled_time, 20_000);

        h.handle
            .send_message(Message::SetSetting(SettingUpdate::new(
                SettingsName::ProtectionPauseExpires,
                0,
            )))
            .await
            .unwrap();
        assert_eq!(h.status().await, PauseStatus::Active);
        assert!(h.alarms.get(PAUSE_ALARM_NAME).is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_pause_duration_from_config() {
        let h = Harness::fresh(1_000);
        let expires = h
            .handle
            .send_envelope(&Envelope::empty(ipc::messages::SET_PAUSE_EXPIRES))
            .await
            .unwrap();
        assert_eq!(
            expires,
            json!(1_000 + ipc::PROTECTION_PAUSE_TIMEOUT_MS as i64)
        );
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_listeners_relays_to_ports() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();

        let delivered = h
            .handle
            .send_message(Message::NotifyListeners(enabled_update(false)))
            .await
            .unwrap();
        assert_eq!(delivered, json!(1));
        assert_eq!(drain(&mut popup), vec![enabled_update(false)]);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_data_seeds_surface_state() {
        let h = Harness::fresh(1_000);
        h.pause_for(30_000).await;

        let state = SurfaceState::from_popup_data(&h.popup_data().await, h.clock.now_ms()).unwrap();
        assert!(state.is_paused(h.clock.now_ms()));
        assert_eq!(state.protection_paused_timer(h.clock.now_ms()), 30);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_resumes_from_expiry_broadcast_alone() {
        let h = Harness::fresh(1_000);
        let mut popup = h
            .handle
            .subscribe("popup", &[NotifierEvent::SettingUpdated])
            .unwrap();
        let mut state = SurfaceState::from_popup_data(&h.popup_data().await, h.clock.now_ms()).unwrap();

        h.pause_for(30_000).await;
        for notification in drain(&mut popup) {
            state.apply(&notification, h.clock.now_ms());
        }
        assert!(state.is_paused(h.clock.now_ms()));

        // При срабатывании будильника приходит только сброс срока
        let envelope = popup.recv().await.unwrap();
        let notification = Notification::from_envelope(&envelope).unwrap();
        assert_eq!(notification, expires_update(0));
        state.apply(&notification, h.clock.now_ms());
        assert!(!state.is_paused(h.clock.now_ms()));
        assert!(state.protection_enabled());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_after_shutdown_disconnected() {
        let h = Harness::fresh(1_000);
        let handle = h.handle.clone();
        h.stop().await;

        assert!(!handle.is_running());
        assert!(matches!(
            handle.send_message(Message::GetPopupData).await,
            Err(PauseError::Disconnected)
        ));
        assert!(handle.connect("popup").is_err());
    }

    // ============================================
    // LONG-LIVED CONNECTION
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn test_connection_delivers_and_closes() {
        let h = Harness::fresh(1_000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = LongLivedConnection::open(
            &h.handle,
            ipc::surfaces::POPUP,
            &[NotifierEvent::SettingUpdated],
            move |notification| {
                let _ = tx.send(notification);
            },
        )
        .unwrap();
        assert_eq!(connection.surface(), "popup");

        h.pause_for(30_000).await;
        assert_eq!(rx.recv().await.unwrap(), expires_update(31_000));

        connection.close().await.unwrap();
        h.popup_data().await;
        assert_eq!(h.notifier.subscriber_count(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_unsubscribes() {
        let h = Harness::fresh(1_000);
        let connection = LongLivedConnection::open(
            &h.handle,
            ipc::surfaces::OPTIONS,
            &[NotifierEvent::SettingUpdated],
            |_| {},
        )
        .unwrap();
        h.popup_data().await;
        assert_eq!(h.notifier.subscriber_count(), 1);

        drop(connection);
        // Помпа завершается асинхронно и закрывает порт
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        h.popup_data().await;
        assert_eq!(h.notifier.subscriber_count(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_reports_background_gone() {
        let h = Harness::fresh(1_000);
        let connection = LongLivedConnection::open(
            &h.handle,
            ipc::surfaces::POPUP,
            &[NotifierEvent::SettingUpdated],
            |_| {},
        )
        .unwrap();
        h.popup_data().await;
        h.stop().await;

        while !connection.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            connection.close().await,
            Err(PauseError::Disconnected)
        ));
    }

    // ============================================
    // LAUNCH
    // ============================================

    #[tokio::test]
    async fn test_launch_persists_pause_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackgroundConfig {
            db_path: dir.path().join("settings.db"),
            ..BackgroundConfig::default()
        };

        let extension = launch(config.clone()).await.unwrap();
        let expires = extension
            .handle
            .send_message(Message::SetPauseExpires(PauseRequest::default()))
            .await
            .unwrap()
            .as_i64()
            .unwrap();
        extension.shutdown().await.unwrap();

        let extension = launch(config).await.unwrap();
        let data = extension
            .handle
            .send_message(Message::GetPopupData)
            .await
            .unwrap();
        assert_eq!(data["settings"]["protection-pause-expires"], json!(expires));
        assert_eq!(
            serde_json::from_value::<PauseStatus>(data["pause"].clone()).unwrap(),
            PauseStatus::Paused {
                expires,
                alarm_armed: true
            }
        );
        assert_eq!(extension.alarms.listener_count(), 1);

        extension
            .handle
            .send_message(Message::RemoveProtectionPauseTimer)
            .await
            .unwrap();
        assert!(extension.settings.is_protection_active(SystemClock.now_ms()));
        extension.shutdown().await.unwrap();
    }
}
