use hsa_core::{
    AgentId, DeviceType, ModuleContext, ModuleKind, Runtime, RuntimeBuilder, RuntimeError, RuntimeModule,
    SystemAttribute, SystemInfoValue, VirtualDriver,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn virtual_runtime() -> (Arc<VirtualDriver>, Runtime) {
    hsa_tracing::init_test_logging();
    let driver = Arc::new(VirtualDriver::new());
    let runtime = Runtime::new(driver.clone());
    (driver, runtime)
}

#[test]
fn balanced_lifecycle_opens_and_closes_once() {
    let (driver, runtime) = virtual_runtime();
    let runtime = Arc::new(runtime);
    runtime.acquire().expect("outer acquire");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for _ in 0..25 {
                    runtime.acquire().expect("nested acquire");
                    assert!(runtime.is_open());
                    assert!(runtime.release());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert!(runtime.release());
    assert!(!runtime.is_open());
    assert_eq!(runtime.ref_count(), 0);
    assert_eq!(driver.open_count(), 1);
    assert_eq!(driver.close_count(), 1);
    assert!(!driver.is_open());
}

#[test]
fn racing_first_acquire_and_last_release_stay_paired() {
    let (driver, runtime) = virtual_runtime();
    let runtime = Arc::new(runtime);
    let start = Arc::new(std::sync::Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..50 {
                    runtime.acquire().expect("acquire from zero");
                    assert!(runtime.is_open());
                    runtime.session().expect("session while acquired");
                    assert!(runtime.release());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert_eq!(runtime.ref_count(), 0);
    assert!(!runtime.is_open());
    assert!(driver.open_count() >= 1);
    assert_eq!(driver.open_count(), driver.close_count());
    assert!(!driver.is_open());
}

#[test]
fn runtime_reopens_after_full_release() {
    let (driver, runtime) = virtual_runtime();
    for _ in 0..3 {
        runtime.acquire().expect("acquire");
        assert!(runtime.release());
    }
    assert_eq!(driver.open_count(), 3);
    assert_eq!(driver.close_count(), 3);
}

#[test]
fn unbalanced_release_is_reported() {
    let (driver, runtime) = virtual_runtime();
    assert!(!runtime.release());
    runtime.acquire().expect("acquire");
    assert!(runtime.release());
    assert!(!runtime.release());
    assert_eq!(driver.close_count(), 1);
}

#[test]
fn driver_open_failure_leaves_runtime_closed() {
    let driver = Arc::new(VirtualDriver::builder().fail_open().build());
    let runtime = Runtime::new(driver.clone());

    let err = runtime.acquire().expect_err("open must fail");
    assert!(matches!(err, RuntimeError::Driver(_)));
    assert_eq!(runtime.ref_count(), 0);
    assert!(!runtime.is_open());
    assert!(!runtime.release());

    assert!(runtime.acquire().is_err());
    assert_eq!(runtime.ref_count(), 0);
}

#[test]
fn empty_topology_is_rejected_and_driver_closed() {
    let driver = Arc::new(VirtualDriver::builder().no_agents().build());
    let runtime = Runtime::new(driver.clone());

    assert!(matches!(runtime.acquire(), Err(RuntimeError::NoAgents)));
    assert_eq!(driver.open_count(), 1);
    assert_eq!(driver.close_count(), 1);
    assert!(!runtime.is_open());
}

#[test]
fn agents_iterate_in_registration_order() {
    let driver = Arc::new(
        VirtualDriver::builder()
            .gpu(1 << 20, false)
            .gpu_without_dma(1 << 20, true)
            .build(),
    );
    let runtime = Runtime::new(driver);
    runtime.acquire().expect("acquire");

    let mut seen = Vec::new();
    runtime
        .iterate_agents(|agent| {
            seen.push((agent.id(), agent.device_type(), agent.is_blit_capable()));
            Ok(())
        })
        .expect("iterate agents");
    assert_eq!(
        seen,
        vec![
            (AgentId::new(0), DeviceType::Cpu, true),
            (AgentId::new(1), DeviceType::Gpu, true),
            (AgentId::new(2), DeviceType::Gpu, false),
        ]
    );

    let session = runtime.session().expect("session");
    assert_eq!(session.gpu_ids(), &[1, 2]);
    assert_eq!(session.blit_agent(), AgentId::new(1));

    let mut regions = 0;
    runtime
        .iterate_regions(AgentId::new(0), |region| {
            assert!(region.is_system());
            regions += 1;
            Ok(())
        })
        .expect("iterate regions");
    assert_eq!(regions, 2);

    drop(session);
    runtime.release();
}

#[test]
fn cpu_only_topology_uses_host_as_blit_agent() {
    let runtime = Runtime::new(Arc::new(VirtualDriver::builder().build()));
    runtime.acquire().expect("acquire");
    let session = runtime.session().expect("session");
    assert_eq!(session.blit_agent(), session.host_agent());
    assert!(session.gpu_ids().is_empty());
    drop(session);
    runtime.release();
}

#[test]
fn queue_ids_are_unique_and_increasing() {
    let (_driver, runtime) = virtual_runtime();
    let runtime = Arc::new(runtime);
    runtime.acquire().expect("acquire");

    let first = runtime.get_queue_id().expect("queue id");
    let second = runtime.get_queue_id().expect("queue id");
    assert!(second > first);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                (0..100)
                    .map(|_| runtime.get_queue_id().expect("queue id"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for worker in workers {
        for id in worker.join().expect("worker thread") {
            assert!(id > second);
            assert!(ids.insert(id), "queue id {id} handed out twice");
        }
    }
    runtime.release();
}

#[test]
fn system_info_reports_known_attributes() {
    let (_driver, runtime) = virtual_runtime();
    runtime.acquire().expect("acquire");

    assert_eq!(
        runtime.get_system_info(SystemAttribute::VersionMajor.into()).expect("major"),
        SystemInfoValue::Version(1)
    );
    let start = runtime.get_system_info(0x200).expect("svm start").as_u64().expect("address");
    let end = runtime.get_system_info(0x201).expect("svm end").as_u64().expect("address");
    assert!(start < end);

    let frequency = runtime.get_system_info(3).expect("frequency").as_u64().expect("number");
    assert!(frequency > 0);

    assert!(matches!(runtime.get_system_info(0x42), Err(RuntimeError::UnknownAttribute(0x42))));
    runtime.release();
}

struct Recorder {
    name: &'static str,
    kind: ModuleKind,
    mask: u64,
    fail: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl RuntimeModule for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn on_load(&mut self, ctx: &ModuleContext<'_>) -> hsa_core::Result<()> {
        assert!(!ctx.agents().is_empty());
        self.log.lock().push(format!("load {}", self.name));
        if self.fail {
            return Err(RuntimeError::module_load(self.name, "refused"));
        }
        Ok(())
    }

    fn on_unload(&mut self) {
        self.log.lock().push(format!("unload {}", self.name));
    }

    fn extension_mask(&self) -> u64 {
        self.mask
    }
}

fn recorder(
    log: &Arc<Mutex<Vec<String>>>,
    name: &'static str,
    kind: ModuleKind,
    mask: u64,
    fail: bool,
) -> impl Fn() -> Box<dyn RuntimeModule> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move || {
        Box::new(Recorder {
            name,
            kind,
            mask,
            fail,
            log: Arc::clone(&log),
        }) as Box<dyn RuntimeModule>
    }
}

#[test]
fn modules_follow_load_and_unload_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = Arc::new(VirtualDriver::new());
    let runtime = RuntimeBuilder::new(driver.clone())
        .module(recorder(&log, "profiler", ModuleKind::Tool, 0, false))
        .module(recorder(&log, "images", ModuleKind::Extension, 0b10, false))
        .module(recorder(&log, "broken", ModuleKind::Extension, 0b100, true))
        .module(recorder(&log, "finalizer", ModuleKind::Extension, 0b01, false))
        .build();

    runtime.acquire().expect("acquire");
    assert_eq!(runtime.session().expect("session").module_count(), 3);
    assert_eq!(
        runtime.get_system_info(SystemAttribute::Extensions.into()).expect("extensions"),
        SystemInfoValue::Extensions(0b11)
    );
    runtime.release();

    assert_eq!(
        *log.lock(),
        vec![
            "load images",
            "load broken",
            "load finalizer",
            "load profiler",
            "unload profiler",
            "unload finalizer",
            "unload images",
        ]
    );
}

#[test]
fn loader_state_is_scoped_to_the_session() {
    let (_driver, runtime) = virtual_runtime();
    runtime.acquire().expect("acquire");
    let session = runtime.session().expect("session");
    let object = session.code_objects().register(vec![0x7fu8, b'E', b'L', b'F']).expect("register");
    let exe = session
        .loader()
        .create_executable(session.code_objects(), &[object])
        .expect("executable");
    assert_eq!(session.loader().executables(), vec![exe]);

    runtime.release();
    assert!(session.loader().executables().is_empty());
    assert!(session.code_objects().is_empty());
}
