//! Executor handler behaviour against a recording backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cockpit_core::events::{EXPERIMENT_EXECUTION, UPDATE_STATUS_LIGHT, USER_ABORT};
use cockpit_core::{
    ActionParam, ActionTable, CockpitError, DeviceHandler, EventBus, EventPayload, Executor,
    HandlerRef, Positioner, TimeMs,
};
use cockpit_executor::{
    AnalogLineConfig, CompletionHook, DelegatedTrigger, DigitalAnalogConfig,
    DigitalAnalogExecutor, Encoding, ExecutorBackend, ExecutorProgram, IndexedPositions,
    ProgramBody, StateAction, LEGACY_ANALOG_MIDPOINT, MAX_DIGITAL_LINES,
};
use parking_lot::Mutex;

struct RecordingBackend {
    digital: Mutex<u32>,
    analog: Mutex<Vec<f64>>,
    programs: Mutex<Vec<ExecutorProgram>>,
    completes: bool,
    aborted: AtomicBool,
}

impl RecordingBackend {
    fn new(completes: bool) -> Arc<Self> {
        Arc::new(Self {
            digital: Mutex::new(0),
            analog: Mutex::new(vec![0.0; 4]),
            programs: Mutex::new(Vec::new()),
            completes,
            aborted: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ExecutorBackend for RecordingBackend {
    async fn read_digital(&self) -> Result<u32> {
        Ok(*self.digital.lock())
    }

    async fn write_digital(&self, state: u32) -> Result<()> {
        *self.digital.lock() = state;
        Ok(())
    }

    async fn read_analog(&self, line: usize) -> Result<f64> {
        Ok(self.analog.lock()[line])
    }

    async fn write_analog(&self, line: usize, level: f64) -> Result<()> {
        self.analog.lock()[line] = level;
        Ok(())
    }

    async fn run(&self, program: ExecutorProgram, done: CompletionHook) -> Result<()> {
        self.programs.lock().push(program);
        if self.completes {
            done();
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn piezo_config(gain: f64, limits: (f64, f64)) -> AnalogLineConfig {
    AnalogLineConfig {
        name: "piezo".to_string(),
        line: 1,
        offset: 0.0,
        gain,
        movement_time: Some(TimeMs::from_ms(1)),
        positions: IndexedPositions::List(vec![2.0, 4.0]),
        limits,
    }
}

fn rig(
    encoding: Encoding,
    backend: Arc<RecordingBackend>,
) -> (Arc<EventBus>, Arc<DigitalAnalogExecutor>, HandlerRef) {
    let bus = Arc::new(EventBus::new());
    let mut config = DigitalAnalogConfig::new("dsp");
    config.encoding = encoding;
    let executor = DigitalAnalogExecutor::new(config, backend, Arc::clone(&bus));
    let cam = executor.register_trigger_line("cam", 0).unwrap();
    (bus, executor, cam)
}

fn counter(bus: &EventBus, event: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    bus.subscribe(event, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[test]
fn runnable_lines_stop_at_foreign_handlers_and_holes() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, cam) = rig(Encoding::Absolute, backend);
    let stranger: Arc<dyn DeviceHandler> = Arc::new(Stranger);
    let stranger = HandlerRef::Generic(stranger);

    let mut table = ActionTable::new();
    table.add_toggle(TimeMs::ZERO, &cam);
    table.add_action(TimeMs::from_ms(1), &stranger, ActionParam::Digital(true));
    table.add_toggle(TimeMs::from_ms(2), &cam);
    table.add_toggle(TimeMs::from_ms(3), &cam);

    assert_eq!(executor.num_runnable_lines(&table, 0), 2);
    assert_eq!(executor.num_runnable_lines(&table, 2), 0);
    assert_eq!(executor.num_runnable_lines(&table, 3), 4);

    table.remove(4);
    assert_eq!(executor.num_runnable_lines(&table, 3), 1);
}

#[test]
fn line_registration_is_validated() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, _cam) = rig(Encoding::Absolute, backend);
    assert!(matches!(
        executor.register_digital("laser", 16),
        Err(CockpitError::Configuration(_))
    ));
    assert!(executor.register_digital("laser", 0).is_err());
    assert!(executor.register_digital("laser", 3).is_ok());

    let mut bad = piezo_config(1.0, (0.0, 10.0));
    bad.line = 9;
    assert!(executor.register_analog(&bad).is_err());
    assert!(executor.register_analog(&piezo_config(1.0, (0.0, 10.0))).is_ok());
    assert!(executor.register_analog(&piezo_config(1.0, (0.0, 10.0))).is_err());
}

#[tokio::test]
async fn lines_beyond_the_digital_word_are_refused() {
    let backend = RecordingBackend::new(true);
    let mut config = DigitalAnalogConfig::new("wide");
    config.dlines = 40;
    let executor = DigitalAnalogExecutor::new(config, backend, Arc::new(EventBus::new()));
    assert!(executor.register_trigger_line("top", MAX_DIGITAL_LINES - 1).is_ok());
    assert!(executor.register_trigger_line("beyond", MAX_DIGITAL_LINES + 3).is_err());
    assert!(executor.set_digital(35, true).await.is_err());
}

#[tokio::test]
async fn absolute_slice_compiles_states_and_signals_completion() {
    let backend = RecordingBackend::new(true);
    let (bus, executor, cam) = rig(Encoding::Absolute, Arc::clone(&backend));
    let piezo = executor.register_analog(&piezo_config(2.0, (0.0, 100.0))).unwrap();
    let piezo_ref = HandlerRef::Positioner(piezo as Arc<dyn Positioner>);
    let executions = counter(&bus, EXPERIMENT_EXECUTION);
    let status = counter(&bus, UPDATE_STATUS_LIGHT);

    let mut table = ActionTable::new();
    table.add_toggle(TimeMs::ZERO, &cam);
    table.add_action(TimeMs::from_us(50), &piezo_ref, ActionParam::Position(5.0));
    table.sort();

    executor
        .execute_table(&table, 0, table.len(), 1, None)
        .await
        .unwrap();

    let programs = backend.programs.lock().clone();
    assert_eq!(programs.len(), 1);
    let ProgramBody::States(states) = &programs[0].body else {
        panic!("expected absolute states");
    };
    assert_eq!(
        states,
        &vec![
            StateAction {
                time: TimeMs::ZERO,
                digital: 1,
                analog: vec![0.0; 4],
            },
            StateAction {
                time: TimeMs::from_us(50),
                digital: 1,
                analog: vec![0.0, 10.0, 0.0, 0.0],
            },
            StateAction {
                time: TimeMs::from_us(100),
                digital: 0,
                analog: vec![0.0, 10.0, 0.0, 0.0],
            },
        ]
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(status.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn indexed_actions_resolve_through_the_line() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, _cam) = rig(Encoding::Absolute, Arc::clone(&backend));
    let piezo = executor.register_analog(&piezo_config(1.0, (0.0, 100.0))).unwrap();
    let piezo_ref = HandlerRef::Positioner(piezo as Arc<dyn Positioner>);

    let mut table = ActionTable::new();
    table.add_action(
        TimeMs::ZERO,
        &piezo_ref,
        ActionParam::Indexed {
            index: 1,
            wavelength: None,
        },
    );
    executor
        .execute_table(&table, 0, 1, 3, Some(TimeMs::from_ms(5)))
        .await
        .unwrap();

    let program = executor.last_program().unwrap();
    assert_eq!(program.num_reps, 3);
    let ProgramBody::States(states) = program.body else {
        panic!("expected absolute states");
    };
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].analog[1], 4.0);
    assert_eq!(states[1].time, TimeMs::from_ms(5));
}

#[tokio::test]
async fn conflicting_simultaneous_actions_are_rejected() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, cam) = rig(Encoding::Absolute, backend);
    let mut table = ActionTable::new();
    table.add_action(TimeMs::ZERO, &cam, ActionParam::Digital(true));
    table.add_action(TimeMs::ZERO, &cam, ActionParam::Digital(true));
    table.add_action(TimeMs::ZERO, &cam, ActionParam::Digital(false));

    let err = executor.execute_table(&table, 0, 3, 1, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CockpitError>(),
        Some(CockpitError::ConflictingActions { .. })
    ));
}

#[tokio::test]
async fn legacy_profile_uses_lowered_baseline_and_pre_run_digital() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, cam) = rig(
        Encoding::LegacyTicks { ticks_per_ms: 10 },
        Arc::clone(&backend),
    );
    let piezo = executor.register_analog(&piezo_config(1.0, (0.0, 70000.0))).unwrap();
    let piezo_ref = HandlerRef::Positioner(Arc::clone(&piezo) as Arc<dyn Positioner>);

    executor.finalize_initialization().await.unwrap();
    assert_eq!(backend.analog.lock().clone(), vec![LEGACY_ANALOG_MIDPOINT; 4]);
    *backend.digital.lock() = 4;
    executor.prepare_for_experiment().await.unwrap();

    let mut table = ActionTable::new();
    table.add_toggle(TimeMs::ZERO, &cam);
    table.add_action(TimeMs::from_ms(1), &piezo_ref, ActionParam::Position(30000.0));
    table.sort();
    executor
        .execute_table(&table, 0, table.len(), 1, None)
        .await
        .unwrap();

    let ProgramBody::Profile(profile) = executor.last_program().unwrap().body else {
        panic!("expected a tick profile");
    };
    assert_eq!(profile.description.init_dio, 4);
    assert_eq!(profile.digitals, vec![(0, 5), (1, 4), (10, 4), (11, 4)]);
    assert_eq!(profile.analogs[1], vec![(0, 2768), (10, 0)]);
    assert_eq!(backend.analog.lock()[1], 30000.0);
    assert_eq!(piezo.position().await.unwrap(), 30000.0);

    executor.cleanup_after_experiment().await.unwrap();
    assert_eq!(backend.analog.lock()[1], LEGACY_ANALOG_MIDPOINT);
}

#[tokio::test]
async fn legacy_profile_is_rebased_and_held_for_the_repeat_duration() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, cam) = rig(
        Encoding::LegacyTicks { ticks_per_ms: 10 },
        Arc::clone(&backend),
    );

    let mut table = ActionTable::new();
    table.add_toggle(TimeMs::from_ms(100), &cam);
    executor
        .execute_table(&table, 0, table.len(), 3, Some(TimeMs::from_ms(50)))
        .await
        .unwrap();

    let program = executor.last_program().unwrap();
    assert_eq!(program.num_reps, 3);
    let ProgramBody::Profile(profile) = program.body else {
        panic!("expected a tick profile");
    };
    assert_eq!(profile.digitals, vec![(0, 1), (1, 0), (500, 0)]);
    assert_eq!(profile.description.count, 500);
}

#[tokio::test]
async fn user_abort_stops_hardware_and_releases_the_wait() {
    let backend = RecordingBackend::new(false);
    let (bus, executor, cam) = rig(Encoding::Absolute, Arc::clone(&backend));
    let mut table = ActionTable::new();
    table.add_toggle(TimeMs::ZERO, &cam);

    let aborter = Arc::clone(&bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        aborter.publish(USER_ABORT, EventPayload::None);
    });

    tokio::time::timeout(
        Duration::from_secs(2),
        executor.execute_table(&table, 0, 2, 1, None),
    )
    .await
    .unwrap()
    .unwrap();

    for _ in 0..50 {
        if backend.aborted.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(backend.aborted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn delegated_trigger_toggles_the_executor_line() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, _cam) = rig(Encoding::Absolute, Arc::clone(&backend));
    let slm =
        DelegatedTrigger::delegate_to("slm", &executor, 5, TimeMs::from_ms(1), TimeMs::from_ms(2))
            .unwrap();
    assert_eq!(slm.response_time(), TimeMs::from_ms(2));
    let slm_ref = HandlerRef::Generic(slm as Arc<dyn DeviceHandler>);

    let mut table = ActionTable::new();
    let end = table.add_toggle(TimeMs::ZERO, &slm_ref);
    assert_eq!(end, TimeMs::from_ms(1));
    assert_eq!(table.get(0).unwrap().handler.name(), "slm trigger");
    assert_eq!(executor.num_runnable_lines(&table, 0), 2);

    executor.execute_table(&table, 0, 2, 1, None).await.unwrap();
    let ProgramBody::States(states) = executor.last_program().unwrap().body else {
        panic!("expected absolute states");
    };
    assert_eq!(states[0].digital, 1 << 5);
    assert_eq!(states[1].digital, 0);
}

#[tokio::test]
async fn software_trigger_pulses_the_client_line() {
    let backend = RecordingBackend::new(true);
    let (_bus, executor, _cam) = rig(Encoding::Absolute, Arc::clone(&backend));
    executor.set_digital(3, true).await.unwrap();
    assert_eq!(*backend.digital.lock(), 8);
    executor.trigger_now("cam").await.unwrap();
    assert_eq!(*backend.digital.lock(), 8);
    assert!(executor.trigger_now("nobody").await.is_err());
}

struct Stranger;

#[async_trait]
impl DeviceHandler for Stranger {
    fn name(&self) -> &str {
        "stranger"
    }

    fn kind(&self) -> cockpit_core::DeviceKind {
        cockpit_core::DeviceKind::Generic
    }
}
