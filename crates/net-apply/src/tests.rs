//! Tests for the apply-confirmation workflow

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::time::Instant;

    use safenet_config::{render_to_string, LayeredConfigWriter};
    use safenet_core::{
        ApplyError, ConstructKind, InterfaceTopologyAnalyzer, NetworkConstruct, NetworkError,
        NetworkState, ParentInfo, Result, RouteEntry, SessionStatus, SystemError, WorkflowEvent,
        WorkflowState,
    };
    use safenet_event_bus::{EventBus, EventListener};

    use crate::routes::{parse_routes, RouteTable};
    use crate::session::SessionGate;
    use crate::workflow::{ApplyConfirmationWorkflow, ApplyOutcome, ApplyRequest, TestPhase};
    use crate::ConfigBackend;

    const ROUTES: &str = "\
default via 192.168.1.1 dev eth0 proto static
10.20.0.0/16 via 192.168.1.254 dev eth0 proto static
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.5
";

    #[derive(Clone, Copy)]
    enum TryBehaviour {
        Accept { after_secs: u64 },
        Reject,
        Hang,
    }

    struct FakeBackend {
        behaviour: TryBehaviour,
        apply_fails: bool,
        tries: AtomicUsize,
        applies: AtomicUsize,
    }

    impl FakeBackend {
        fn new(behaviour: TryBehaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                apply_fails: false,
                tries: AtomicUsize::new(0),
                applies: AtomicUsize::new(0),
            })
        }

        fn failing_apply(behaviour: TryBehaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                apply_fails: true,
                tries: AtomicUsize::new(0),
                applies: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConfigBackend for FakeBackend {
        async fn try_candidate(&self, _timeout_seconds: u64) -> Result<()> {
            self.tries.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                TryBehaviour::Accept { after_secs } => {
                    tokio::time::sleep(Duration::from_secs(after_secs)).await;
                    Ok(())
                }
                TryBehaviour::Reject => Err(NetworkError::System(SystemError::CommandExit {
                    command: "netplan try".to_string(),
                    code: Some(78),
                    stderr: "Error in network definition".to_string(),
                })),
                TryBehaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    Ok(())
                }
            }
        }

        async fn apply(&self) -> Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if self.apply_fails {
                return Err(NetworkError::System(SystemError::CommandExit {
                    command: "netplan apply".to_string(),
                    code: Some(1),
                    stderr: "read-only file system".to_string(),
                }));
            }
            Ok(())
        }
    }

    /// In-memory routing table
    struct FakeRoutes {
        routes: Mutex<Vec<RouteEntry>>,
        lists: AtomicUsize,
        adds: AtomicUsize,
    }

    impl FakeRoutes {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(parse_routes(ROUTES, false)),
                lists: AtomicUsize::new(0),
                adds: AtomicUsize::new(0),
            })
        }

        fn drop_default_route(&self) {
            self.routes.lock().unwrap().retain(|r| !r.is_default());
        }

        fn has_default_route(&self) -> bool {
            self.routes.lock().unwrap().iter().any(|r| r.is_default())
        }
    }

    #[async_trait]
    impl RouteTable for FakeRoutes {
        async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(self.routes.lock().unwrap().clone())
        }

        async fn add_route(&self, route: &RouteEntry) -> Result<()> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            let mut routes = self.routes.lock().unwrap();
            if !routes.iter().any(|r| r.same_route(route)) {
                routes.push(route.clone());
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingListener {
        events: Arc<Mutex<Vec<WorkflowEvent>>>,
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        async fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        _temp_dir: TempDir,
        store: std::path::PathBuf,
        backend: Arc<FakeBackend>,
        routes: Arc<FakeRoutes>,
        gate: Arc<SessionGate>,
        workflow: Arc<ApplyConfirmationWorkflow>,
    }

    fn harness(backend: Arc<FakeBackend>) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("netplan");
        let routes = FakeRoutes::new();
        let gate = Arc::new(SessionGate::new());
        let workflow = ApplyConfirmationWorkflow::new(
            LayeredConfigWriter::new(&store),
            backend.clone(),
            routes.clone(),
            gate.clone(),
        );

        Harness {
            _temp_dir: temp_dir,
            store,
            backend,
            routes,
            gate,
            workflow: Arc::new(workflow),
        }
    }

    fn vlan_request(timeout_seconds: u64) -> ApplyRequest {
        let vlan = NetworkConstruct::vlan("eth0.100", "eth0", 100)
            .with_attribute("addresses", "10.0.100.2/24");
        let content = render_to_string(&vlan, "networkd").unwrap();
        ApplyRequest::new(timeout_seconds).upsert(
            vlan,
            ParentInfo::of(ConstructKind::Physical),
            content,
        )
    }

    fn store_files(store: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(store) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_scenario_a_vlan_on_physical() {
        let analysis = InterfaceTopologyAnalyzer::analyze("eth0.100");
        assert_eq!(analysis.kind, ConstructKind::Vlan);
        let parent = analysis.parent.as_ref().unwrap();
        assert_eq!(parent.name.as_deref(), Some("eth0"));
        assert_eq!(parent.kind, ConstructKind::Physical);
        assert_eq!(
            LayeredConfigWriter::priority_for(ConstructKind::Vlan, Some(ConstructKind::Physical)),
            85
        );

        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 1 }));
        let phase = h.workflow.begin(vlan_request(30)).await.unwrap();
        assert_eq!(phase.state(), WorkflowState::AwaitingConfirmation);
        assert_eq!(store_files(&h.store), vec!["85-xavs-eth0.100.yaml"]);

        let pending = phase.into_pending().unwrap();
        let outcome = h.workflow.apply_permanently(pending).await;
        assert_eq!(outcome.network_state(), NetworkState::Active);
        assert_eq!(h.backend.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_timeout_reverts() {
        let h = harness(FakeBackend::new(TryBehaviour::Hang));

        let start = Instant::now();
        let phase = h.workflow.begin(vlan_request(60)).await.unwrap();
        let elapsed = start.elapsed();

        let outcome = match phase {
            TestPhase::TimedOut(outcome) => outcome,
            other => panic!("expected timeout, got {:?}", other.state()),
        };
        assert!(elapsed >= Duration::from_secs(65) && elapsed < Duration::from_secs(66));
        assert_eq!(outcome.state(), WorkflowState::TimedOutReverted);
        assert_eq!(outcome.network_state(), NetworkState::RolledBack);
        assert_eq!(
            outcome.error(),
            Some(ApplyError::ConnectivityLost {
                timeout_seconds: 60
            })
        );
        assert_eq!(h.backend.applies.load(Ordering::SeqCst), 0);
        assert_eq!(h.routes.adds.load(Ordering::SeqCst), 0);
        assert!(!h.gate.is_busy());
    }

    #[tokio::test]
    async fn test_scenario_c_default_route_restored() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        assert_eq!(pending.snapshot().unwrap().len(), 3);

        // The tested configuration lost the default route
        h.routes.drop_default_route();
        assert!(!h.routes.has_default_route());

        let outcome = h.workflow.apply_permanently(pending).await;
        match &outcome {
            ApplyOutcome::AppliedPermanently { routes, .. } => {
                let report = routes.as_ref().unwrap();
                assert_eq!(report.restored.len(), 1);
                assert!(report.restored[0].is_default());
                assert_eq!(report.already_present, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.routes.has_default_route());
        assert_eq!(outcome.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_d_second_attempt_rejected() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 10 }));

        let first = {
            let workflow = h.workflow.clone();
            tokio::spawn(async move { workflow.begin(vlan_request(30)).await })
        };
        while !h.gate.is_busy() {
            tokio::task::yield_now().await;
        }

        let err = h.workflow.begin(vlan_request(30)).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Apply(ApplyError::SessionAlreadyRunning { .. })
        ));

        let phase = first.await.unwrap().unwrap();
        assert_eq!(phase.state(), WorkflowState::AwaitingConfirmation);
        assert_eq!(h.backend.tries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_begins_keep_winner_files() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let vlan200 = NetworkConstruct::vlan("eth0.200", "eth0", 200);
        let other = ApplyRequest::new(30).upsert(
            vlan200.clone(),
            ParentInfo::of(ConstructKind::Physical),
            render_to_string(&vlan200, "networkd").unwrap(),
        );

        let (first, second) = tokio::join!(
            h.workflow.begin(vlan_request(30)),
            h.workflow.begin(other)
        );

        let (phase, err) = match (first, second) {
            (Ok(phase), Err(err)) | (Err(err), Ok(phase)) => (phase, err),
            (a, b) => panic!("expected one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
        };
        assert!(matches!(
            err,
            NetworkError::Apply(ApplyError::SessionAlreadyRunning { .. })
        ));
        assert_eq!(h.backend.tries.load(Ordering::SeqCst), 1);

        let winner = store_files(&h.store);
        assert_eq!(winner.len(), 1);
        let pending = phase.into_pending().unwrap();
        let outcome = h.workflow.apply_permanently(pending).await;
        assert_eq!(outcome.state(), WorkflowState::AppliedPermanently);
        assert_eq!(store_files(&h.store), winner);
    }

    #[tokio::test]
    async fn test_gate_held_until_confirmation() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        assert_eq!(h.gate.holder(), Some(pending.attempt_id()));

        let err = h.workflow.begin(vlan_request(30)).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Apply(ApplyError::SessionAlreadyRunning { ref session_id })
                if *session_id == pending.attempt_id().to_string()
        ));
        assert_eq!(store_files(&h.store), vec!["85-xavs-eth0.100.yaml"]);

        h.workflow.keep_temporary(pending).await;
        assert!(!h.gate.is_busy());
        let phase = h.workflow.begin(vlan_request(30)).await.unwrap();
        assert_eq!(phase.state(), WorkflowState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn test_failed_test_releases_gate() {
        let h = harness(FakeBackend::new(TryBehaviour::Reject));
        let phase = h.workflow.begin(vlan_request(30)).await.unwrap();
        assert_eq!(phase.state(), WorkflowState::TestFailed);
        assert!(!h.gate.is_busy());
    }

    #[tokio::test]
    async fn test_rejected_candidate_reports_test_failed() {
        let h = harness(FakeBackend::new(TryBehaviour::Reject));
        let phase = h.workflow.begin(vlan_request(30)).await.unwrap();

        let outcome = match phase {
            TestPhase::Failed(outcome) => outcome,
            other => panic!("expected failure, got {:?}", other.state()),
        };
        assert_eq!(outcome.network_state(), NetworkState::Unchanged);
        assert!(matches!(
            outcome.error(),
            Some(ApplyError::InvalidConfiguration { ref reason })
                if reason.contains("Error in network definition")
        ));
        assert!(outcome.describe().contains("rejected"));
        // Staged files stay for the operator to fix
        assert_eq!(store_files(&h.store), vec!["85-xavs-eth0.100.yaml"]);
        assert_eq!(h.routes.adds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keep_temporary_restores_routes_without_persisting() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        h.routes.drop_default_route();

        let outcome = h.workflow.keep_temporary(pending).await;
        assert_eq!(outcome.state(), WorkflowState::KeptTemporary);
        assert_eq!(outcome.network_state(), NetworkState::Temporary);
        assert!(h.routes.has_default_route());
        assert_eq!(h.backend.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_revert_restores_previous_store() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let writer = h.workflow.writer();

        let eth0 = NetworkConstruct::physical("eth0");
        let handle = writer.handle_for(&eth0, ParentInfo::none()).unwrap();
        writer.write(&handle, "network:\n  version: 2\n").await.unwrap();

        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        assert_eq!(
            store_files(&h.store),
            vec!["80-xavs-eth0.yaml", "85-xavs-eth0.100.yaml"]
        );
        h.routes.drop_default_route();

        let outcome = h.workflow.revert(pending).await;
        match &outcome {
            ApplyOutcome::Reverted { files, .. } => assert_eq!(files.removed.len(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outcome.network_state(), NetworkState::RolledBack);
        assert_eq!(store_files(&h.store), vec!["80-xavs-eth0.yaml"]);
        assert_eq!(h.backend.applies.load(Ordering::SeqCst), 1);
        // The revert target owns its routes
        assert_eq!(h.routes.adds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_distinct_outcome() {
        let h = harness(FakeBackend::failing_apply(TryBehaviour::Accept {
            after_secs: 0,
        }));
        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        h.routes.drop_default_route();

        let outcome = h.workflow.apply_permanently(pending).await;
        assert_eq!(outcome.state(), WorkflowState::PersistenceFailed);
        assert_eq!(outcome.network_state(), NetworkState::Unknown);
        assert!(matches!(
            outcome.error(),
            Some(ApplyError::PersistenceFailure { .. })
        ));
        assert!(!outcome.is_success());
        assert!(!h.routes.has_default_route());
    }

    #[tokio::test]
    async fn test_revert_failure_is_most_severe() {
        let h = harness(FakeBackend::failing_apply(TryBehaviour::Accept {
            after_secs: 0,
        }));
        let pending = h
            .workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();

        let outcome = h.workflow.revert(pending).await;
        assert_eq!(outcome.state(), WorkflowState::RevertFailed);
        let error = outcome.error().unwrap();
        assert!(matches!(error, ApplyError::RevertFailure { .. }));
        assert_eq!(error.severity(), 5);
        assert!(outcome.describe().contains("neither the old nor the new"));
    }

    #[tokio::test]
    async fn test_staging_failure_restores_store() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let writer = h.workflow.writer();
        let eth0 = NetworkConstruct::physical("eth0");
        let handle = writer.handle_for(&eth0, ParentInfo::none()).unwrap();
        writer.write(&handle, "before\n").await.unwrap();

        let request = ApplyRequest::new(30)
            .upsert(eth0, ParentInfo::none(), "after\n")
            .upsert(
                NetworkConstruct::physical("9bad"),
                ParentInfo::none(),
                "never\n",
            );

        let err = h.workflow.begin(request).await.unwrap_err();
        assert!(matches!(err, NetworkError::Topology(_)));
        assert_eq!(std::fs::read_to_string(&handle.path).unwrap(), "before\n");
        assert_eq!(h.backend.tries.load(Ordering::SeqCst), 0);
        assert!(!h.gate.is_busy());
    }

    #[tokio::test]
    async fn test_without_route_preservation() {
        let h = harness(FakeBackend::new(TryBehaviour::Accept { after_secs: 0 }));
        let pending = h
            .workflow
            .begin(vlan_request(30).with_preserve_routes(false))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        assert!(pending.snapshot().is_none());

        let outcome = h.workflow.apply_permanently(pending).await;
        assert_eq!(
            outcome,
            ApplyOutcome::AppliedPermanently {
                attempt_id: outcome.attempt_id(),
                routes: None
            }
        );
        assert_eq!(h.routes.lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_events_and_journal_follow_attempt() {
        let temp_dir = TempDir::new().unwrap();
        let journal_dir = temp_dir.path().join("journal");
        let bus = Arc::new(EventBus::new());
        let listener = RecordingListener::default();
        bus.register_listener("recorder", listener.clone())
            .await
            .unwrap();

        let backend = FakeBackend::new(TryBehaviour::Accept { after_secs: 0 });
        let routes = FakeRoutes::new();
        let workflow = ApplyConfirmationWorkflow::new(
            LayeredConfigWriter::new(temp_dir.path().join("netplan")),
            backend,
            routes,
            Arc::new(SessionGate::new()),
        )
        .with_event_bus(bus)
        .with_journal_dir(journal_dir.clone());

        let pending = workflow
            .begin(vlan_request(30))
            .await
            .unwrap()
            .into_pending()
            .unwrap();
        let attempt_id = pending.attempt_id();
        let session_id = pending.session_id();
        workflow.apply_permanently(pending).await;

        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                WorkflowEvent::StateChanged {
                    attempt_id,
                    state: WorkflowState::Testing
                },
                WorkflowEvent::SessionStarted {
                    attempt_id,
                    session_id,
                    timeout_seconds: 30
                },
                WorkflowEvent::SessionResolved {
                    attempt_id,
                    session_id,
                    status: SessionStatus::Succeeded
                },
                WorkflowEvent::StateChanged {
                    attempt_id,
                    state: WorkflowState::AwaitingConfirmation
                },
                WorkflowEvent::RoutesRestored {
                    attempt_id,
                    restored: 0,
                    failed: 0
                },
                WorkflowEvent::StateChanged {
                    attempt_id,
                    state: WorkflowState::AppliedPermanently
                },
            ]
        );

        let journal =
            std::fs::read_to_string(journal_dir.join(format!("{}.log", attempt_id))).unwrap();
        let states: Vec<String> = journal
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["state"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            states,
            vec!["Testing", "AwaitingConfirmation", "AppliedPermanently"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_settings_driven_workflow_with_real_commands() {
        use safenet_config::EngineSettings;

        let temp_dir = TempDir::new().unwrap();
        let settings = EngineSettings {
            config_dir: temp_dir.path().join("netplan"),
            journal_dir: Some(temp_dir.path().join("journal")),
            netplan_path: "true".to_string(),
            ip_path: "true".to_string(),
            test_timeout_seconds: 15,
            preserve_routes: false,
            ..EngineSettings::default()
        };
        let workflow =
            ApplyConfirmationWorkflow::from_settings(&settings, Arc::new(SessionGate::new()));

        let bond = NetworkConstruct::bond("bond0", &["eth0", "eth1"]);
        let request = ApplyRequest::from_settings(&settings).upsert(
            bond,
            ParentInfo::of(ConstructKind::Physical),
            "network:\n  version: 2\n  bonds:\n    bond0:\n      interfaces: [eth0, eth1]\n",
        );
        assert_eq!(request.timeout_seconds, 15);
        assert!(!request.preserve_routes);

        let pending = workflow.begin(request).await.unwrap().into_pending().unwrap();
        let attempt_id = pending.attempt_id();
        let outcome = workflow.apply_permanently(pending).await;
        assert_eq!(outcome.state(), WorkflowState::AppliedPermanently);

        let written =
            std::fs::read_to_string(settings.config_dir.join("87-xavs-bond0.yaml")).unwrap();
        assert!(written.starts_with("network:\n  renderer: networkd\n"));
        assert!(settings
            .journal_dir
            .unwrap()
            .join(format!("{}.log", attempt_id))
            .exists());
    }
}
