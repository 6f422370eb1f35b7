//! Law checks over a scripted operation sequence: after every step the
//! full store contents must satisfy the engine's universal invariants.

use std::collections::{HashMap, HashSet, VecDeque};

use foreman_engine::{
    DepType, NewTask, Priority, TaskFacade, TaskStatus, TaskStore, TaskType,
};
use foreman_store::SqliteStore;

async fn create_facade() -> TaskFacade<SqliteStore> {
    let store = SqliteStore::new(":memory:").await.unwrap();
    store.migrate().await.unwrap();
    TaskFacade::new(store)
}

/// Assert every universal invariant against the store's full state.
/// `comment_floor` tracks comment counts across calls to check that no
/// operation ever shrinks an audit trail.
async fn assert_invariants(
    facade: &mut TaskFacade<SqliteStore>,
    comment_floor: &mut HashMap<String, usize>,
) {
    let tasks = facade.store_mut().load_all_tasks().await.unwrap();
    let deps = facade.store_mut().load_all_dependencies().await.unwrap();
    let by_id: HashMap<&str, &foreman_engine::Task> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    // completed <=> completed_at set
    for task in &tasks {
        assert_eq!(
            task.status == TaskStatus::Completed,
            task.completed_at.is_some(),
            "completed_at mismatch on {}",
            task.id
        );
    }

    // containers are never blocked, and the store never holds ephemerals
    for task in &tasks {
        if task.task_type == TaskType::Container {
            assert_ne!(task.status, TaskStatus::Blocked, "blocked container {}", task.id);
        }
        assert_ne!(task.task_type, TaskType::Ephemeral, "persisted ephemeral {}", task.id);
    }

    // blocked <=> a non-terminal blocking source exists (the script
    // below drives blocked status through the dependency protocol only)
    for task in &tasks {
        let non_terminal_blockers = deps
            .iter()
            .filter(|d| d.dep_type == DepType::Blocks && d.dst_id == task.id)
            .filter(|d| by_id.get(d.src_id.as_str()).is_some_and(|s| !s.status.is_terminal()))
            .count();
        if task.status == TaskStatus::Blocked {
            assert!(non_terminal_blockers > 0, "blocked without blocker: {}", task.id);
        }
        // containers shed blocked status on conversion even when old
        // edges remain, so they are exempt from the reverse direction
        if non_terminal_blockers > 0 && task.task_type != TaskType::Container {
            assert_ne!(
                task.status,
                TaskStatus::Pending,
                "pending despite blockers: {}",
                task.id
            );
        }
    }

    // no cycle in the blocks subgraph over non-terminal tasks
    assert_acyclic(&tasks, &deps);

    // ready queue is exactly the characterised set, in order
    let mut expected: Vec<&foreman_engine::Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && t.task_type != TaskType::Container)
        .filter(|t| {
            !deps.iter().any(|d| {
                d.dep_type == DepType::Blocks
                    && d.dst_id == t.id
                    && by_id.get(d.src_id.as_str()).is_some_and(|s| !s.status.is_terminal())
            })
        })
        .collect();
    expected.sort_by(|a, b| {
        (a.priority, a.created_at, a.id.as_str()).cmp(&(b.priority, b.created_at, b.id.as_str()))
    });
    let ready: Vec<String> = facade
        .get_ready_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    let expected_ids: Vec<String> = expected.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ready, expected_ids, "ready queue mismatch");

    // audit trails never shrink and stay timestamp-monotone
    for task in &tasks {
        let floor = comment_floor.entry(task.id.clone()).or_insert(0);
        assert!(
            task.comments.len() >= *floor,
            "comment trail shrank on {}",
            task.id
        );
        *floor = task.comments.len();
        for pair in task.comments.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}

fn assert_acyclic(tasks: &[foreman_engine::Task], deps: &[foreman_engine::Dependency]) {
    let live: HashSet<&str> = tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id.as_str())
        .collect();

    let mut indegree: HashMap<&str, usize> = live.iter().map(|id| (*id, 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in deps {
        if dep.dep_type == DepType::Blocks
            && live.contains(dep.src_id.as_str())
            && live.contains(dep.dst_id.as_str())
        {
            outgoing
                .entry(dep.src_id.as_str())
                .or_default()
                .push(dep.dst_id.as_str());
            *indegree.entry(dep.dst_id.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        if let Some(next) = outgoing.get(node) {
            for dst in next {
                let n = indegree.get_mut(dst).unwrap();
                *n -= 1;
                if *n == 0 {
                    queue.push_back(dst);
                }
            }
        }
    }
    assert_eq!(processed, live.len(), "cycle in the blocking subgraph");
}

#[tokio::test]
async fn test_invariants_hold_across_scripted_sequence() {
    let mut facade = create_facade().await;
    let mut floor = HashMap::new();

    let plan = facade
        .create_task(NewTask::titled("Plan the migration").priority(Priority::High))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    let schema = facade
        .create_task(NewTask::titled("Write schema").after(&plan.id))
        .await
        .unwrap();
    let backfill = facade
        .create_task(
            NewTask::titled("Backfill data")
                .priority(Priority::Critical)
                .after(&schema.id),
        )
        .await
        .unwrap();
    let docs = facade
        .create_task(NewTask::titled("Document it").priority(Priority::Wishlist))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade
        .add_dependency(&plan.id, &docs.id, DepType::Blocks)
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade.set_current_task(&plan.id).await.unwrap();
    facade
        .add_comment(&plan.id, "planner", "decomposed into three steps")
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    let result = facade.complete_task(&plan.id).await.unwrap();
    assert_eq!(result.unblocked.len(), 2);
    assert_invariants(&mut facade, &mut floor).await;

    facade.set_current_task(&schema.id).await.unwrap();
    facade
        .submit_work(&schema.id, "executor", "schema landed", Some("3f2c1aa"))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade.complete_task(&schema.id).await.unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    // cancel instead of completing: dependents still get released
    let cleanup = facade
        .create_task(NewTask::titled("Cleanup").after(&backfill.id))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade
        .update_status(&backfill.id, TaskStatus::Cancelled)
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;
    assert_eq!(
        facade.get_task(&cleanup.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    // conversion to container relaxes a blocked task
    let holder = facade.create_task(NewTask::titled("Holder")).await.unwrap();
    let grouped = facade
        .create_task(NewTask::titled("Grouped").after(&holder.id))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade
        .update_task_type(&grouped.id, TaskType::Container)
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    // deleting a blocker releases its destinations
    let doomed = facade.create_task(NewTask::titled("Doomed blocker")).await.unwrap();
    let waiting = facade
        .create_task(NewTask::titled("Waiting on doomed").after(&doomed.id))
        .await
        .unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    facade.delete_task(&doomed.id).await.unwrap();
    floor.remove(&doomed.id);
    assert_invariants(&mut facade, &mut floor).await;
    assert_eq!(
        facade.get_task(&waiting.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    facade.complete_task(&docs.id).await.unwrap();
    assert_invariants(&mut facade, &mut floor).await;

    let counts = facade.get_task_counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.blocked, 0);
}
