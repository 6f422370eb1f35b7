use foreman_engine::{NewTask, Priority, TaskFacade, TaskType};
use foreman_store::{DepType, SqliteStore, TaskStore};
use foreman_sync::{
    BootstrapOutcome, SyncBridge, DEPENDENCIES_FILE, SESSION_STATE_FILE, TASKS_FILE,
};

async fn create_store() -> SqliteStore {
    let store = SqliteStore::new(":memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
}

/// Three tasks (one commented twice, one labelled, one completed), a
/// `blocks` edge and a `parent` edge: the round-trip fixture.
async fn populated_facade() -> TaskFacade<SqliteStore> {
    let mut facade = TaskFacade::new(create_store().await);

    let commented = facade
        .create_task(NewTask::titled("Commented task").priority(Priority::High))
        .await
        .unwrap();
    facade
        .add_comment(&commented.id, "planner", "split from the epic")
        .await
        .unwrap();
    facade
        .add_comment(&commented.id, "executor", "SUMMARY: landed")
        .await
        .unwrap();

    let labelled = facade
        .create_task(
            NewTask::titled("Labelled task")
                .description("carries labels")
                .labels(vec!["infra".to_string(), "sync".to_string()]),
        )
        .await
        .unwrap();

    let done = facade.create_task(NewTask::titled("Finished task")).await.unwrap();
    facade.complete_task(&done.id).await.unwrap();

    facade
        .add_dependency(&labelled.id, &commented.id, DepType::Blocks)
        .await
        .unwrap();
    facade
        .add_dependency(&done.id, &labelled.id, DepType::Parent)
        .await
        .unwrap();

    facade
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;

    let stats = bridge.export(facade.store_mut()).await.unwrap();
    assert_eq!(stats.tasks, 3);
    assert_eq!(stats.dependencies, 2);

    let mut fresh = create_store().await;
    let imported = bridge.import(&mut fresh).await.unwrap();
    assert_eq!(imported.tasks, 3);
    assert_eq!(imported.dependencies, 2);

    // every field survives the trip
    let original = facade.store_mut().load_all_tasks().await.unwrap();
    let restored = fresh.load_all_tasks().await.unwrap();
    assert_eq!(original, restored);

    let original_deps = facade.store_mut().load_all_dependencies().await.unwrap();
    let restored_deps = fresh.load_all_dependencies().await.unwrap();
    assert_eq!(original_deps, restored_deps);

    // the blocking relation recomputes identically
    for task in &original {
        assert_eq!(
            facade.store_mut().get_blocked_by_count(&task.id).await.unwrap(),
            fresh.get_blocked_by_count(&task.id).await.unwrap(),
        );
    }
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;
    bridge.export(facade.store_mut()).await.unwrap();

    let mut fresh = create_store().await;
    let first = bridge.import(&mut fresh).await.unwrap();
    assert_eq!(first.tasks, 3);

    let second = bridge.import(&mut fresh).await.unwrap();
    assert_eq!(second.tasks, 0);
    assert_eq!(second.dependencies, 0);

    // no duplicated comments either
    let tasks = fresh.load_all_tasks().await.unwrap();
    let commented = tasks.iter().find(|t| t.comments.len() == 2);
    assert!(commented.is_some(), "comment trail duplicated on re-import");
}

#[tokio::test]
async fn test_import_keeps_first_loaded_row() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;
    bridge.export(facade.store_mut()).await.unwrap();

    // a store that already holds one of the exported ids
    let mut target = create_store().await;
    let original = facade.store_mut().load_all_tasks().await.unwrap();
    let mut hijacked = original[0].clone();
    hijacked.title = "Locally diverged".to_string();
    hijacked.comments.clear();
    target.save_task(&hijacked).await.unwrap();

    let stats = bridge.import(&mut target).await.unwrap();
    assert_eq!(stats.tasks, original.len() - 1);

    let kept = target.load_task(&hijacked.id).await.unwrap().unwrap();
    assert_eq!(kept.title, "Locally diverged");
}

#[tokio::test]
async fn test_bootstrap_branches() {
    // branch 1: store data wins, files are ignored
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;
    bridge.export(facade.store_mut()).await.unwrap();

    let outcome = bridge.bootstrap(facade.store_mut()).await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::LoadedExisting { tasks: 3 });

    // branch 2: empty store, files present
    let mut fresh = create_store().await;
    let outcome = bridge.bootstrap(&mut fresh).await.unwrap();
    match outcome {
        BootstrapOutcome::Imported(stats) => assert_eq!(stats.tasks, 3),
        other => panic!("expected import, got {other:?}"),
    }

    // branch 3: nothing anywhere
    let empty_dir = tempfile::tempdir().unwrap();
    let empty_bridge = SyncBridge::new(empty_dir.path());
    let mut empty_store = create_store().await;
    let outcome = empty_bridge.bootstrap(&mut empty_store).await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Empty);
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;
    bridge.export(facade.store_mut()).await.unwrap();

    // corrupt the export: prepend garbage and a bad id
    let tasks_path = dir.path().join(TASKS_FILE);
    let good = std::fs::read_to_string(&tasks_path).unwrap();
    let corrupted = format!(
        "not json at all\n{{\"id\":\"UPPERCASE\",\"title\":\"bad id\",\"status\":\"pending\",\
         \"priority\":\"medium\",\"task_type\":\"task\",\"created_at\":1700000000,\
         \"updated_at\":1700000000,\"completed_at\":null}}\n{good}"
    );
    std::fs::write(&tasks_path, corrupted).unwrap();

    let mut fresh = create_store().await;
    let stats = bridge.import(&mut fresh).await.unwrap();
    assert_eq!(stats.tasks, 3);
    assert_eq!(fresh.load_all_tasks().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_ephemeral_tasks_never_reach_the_export() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;
    facade
        .create_task(NewTask::titled("Scratch").task_type(TaskType::Ephemeral))
        .await
        .unwrap();

    let stats = bridge.export(facade.store_mut()).await.unwrap();
    assert_eq!(stats.tasks, 3);

    let contents = std::fs::read_to_string(dir.path().join(TASKS_FILE)).unwrap();
    assert!(!contents.contains("ephemeral"));
    assert!(!contents.contains("Scratch"));
}

#[tokio::test]
async fn test_session_state_markdown() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;

    facade.start_session().await.unwrap();
    let ready = facade.get_ready_tasks().await.unwrap();
    let current = facade.set_current_task(&ready[0].id).await.unwrap();

    let session = facade.session_state();
    bridge
        .write_session_state(facade.store_mut(), session.as_ref())
        .await
        .unwrap();

    let md = std::fs::read_to_string(dir.path().join(SESSION_STATE_FILE)).unwrap();
    assert!(md.contains("# Session State"));
    assert!(md.contains(&session.unwrap().session_id));
    assert!(md.contains(&format!("`{}` {}", current.id, current.title)));
    assert!(md.contains("## Ready Queue"));
    assert!(md.contains("## Recently Completed"));
    assert!(md.contains("Finished task"));
}

#[tokio::test]
async fn test_export_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = SyncBridge::new(dir.path());
    let mut facade = populated_facade().await;

    bridge.export(facade.store_mut()).await.unwrap();
    bridge
        .write_session_state(facade.store_mut(), None)
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n == TASKS_FILE));
    assert!(names.iter().any(|n| n == DEPENDENCIES_FILE));
    assert!(names.iter().any(|n| n == SESSION_STATE_FILE));
    assert!(!names.iter().any(|n| n.ends_with(".tmp")));
}
