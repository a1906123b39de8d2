//! Integration tests for the flux-kernel scheduler against concrete
//! scenarios from the submission-evaluation-core specification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flux_kernel::{CmdExecType, Command, LaunchResult, Resources, Scheduler, TaskRequest, TaskState};

fn budget() -> Resources {
    Resources::new(200, 2000)
}

#[tokio::test]
async fn scenario_output_mode_captures_stdout() {
    let scheduler = Scheduler::new(budget(), 16);
    scheduler.start();

    let done = Arc::new(tokio::sync::Notify::new());
    let done2 = Arc::clone(&done);
    let captured: Arc<Mutex<Option<LaunchResult>>> = Arc::new(Mutex::new(None));
    let captured2 = Arc::clone(&captured);

    scheduler
        .schedule(TaskRequest {
            name: "echo-hello".into(),
            resources: Resources::new(5, 5),
            command: Command::new("echo", vec!["hello".into()], CmdExecType::Output),
            priority: 50,
            scheduling_retries: 3,
            on_launch_complete: Box::new(move |res| {
                *captured2.lock().unwrap() = Some(res);
                done2.notify_one();
            }),
            on_task_complete: None,
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), done.notified())
        .await
        .unwrap();

    let res = captured.lock().unwrap().take().unwrap();
    assert!(res.error.is_none());
    assert_eq!(res.output.unwrap(), b"hello\n");
}

#[tokio::test]
async fn scenario_run_mode_nonzero_exit_is_failed() {
    let scheduler = Scheduler::new(budget(), 16);
    scheduler.start();

    let done = Arc::new(tokio::sync::Notify::new());
    let done2 = Arc::clone(&done);
    let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let error2 = Arc::clone(&error);

    let id = scheduler
        .schedule(TaskRequest {
            name: "exit-1".into(),
            resources: Resources::new(5, 5),
            command: Command::new("sh", vec!["-c".into(), "exit 1".into()], CmdExecType::Run),
            priority: 50,
            scheduling_retries: 3,
            on_launch_complete: Box::new(move |res| {
                *error2.lock().unwrap() = res.error;
                done2.notify_one();
            }),
            on_task_complete: None,
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), done.notified())
        .await
        .unwrap();

    assert_eq!(scheduler.get_task_state(id).unwrap(), TaskState::Failed);
    assert!(error.lock().unwrap().as_ref().unwrap().contains('1'));
}

#[tokio::test]
async fn scenario_preemption_kills_lower_priority_long_runner() {
    let scheduler = Scheduler::new(budget(), 16);
    scheduler.start();

    let sleeper_killed = Arc::new(AtomicBool::new(false));
    let sleeper_killed2 = Arc::clone(&sleeper_killed);
    let sleeper_state: Arc<Mutex<Option<TaskState>>> = Arc::new(Mutex::new(None));
    let sleeper_state2 = Arc::clone(&sleeper_state);

    scheduler
        .schedule(TaskRequest {
            name: "sleep-100".into(),
            resources: Resources::new(199, 1999),
            command: Command::new("sleep", vec!["100".into()], CmdExecType::LongRunning),
            priority: 30,
            scheduling_retries: 3,
            on_launch_complete: Box::new(|_| {}),
            on_task_complete: Some(Box::new(move |state| {
                *sleeper_state2.lock().unwrap() = Some(state);
                sleeper_killed2.store(true, Ordering::SeqCst);
            })),
        })
        .await
        .unwrap();

    // Give the sleeper time to actually reach Running before the preempting
    // request arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let quick_done = Arc::new(tokio::sync::Notify::new());
    let quick_done2 = Arc::clone(&quick_done);
    let quick_id = scheduler
        .schedule(TaskRequest {
            name: "true".into(),
            resources: Resources::new(10, 100),
            command: Command::new("true", vec![], CmdExecType::Run),
            priority: 50,
            scheduling_retries: 3,
            on_launch_complete: Box::new(move |_| {
                quick_done2.notify_one();
            }),
            on_task_complete: None,
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), quick_done.notified())
        .await
        .expect("higher priority task should be admitted via preemption");

    tokio::time::timeout(Duration::from_secs(5), async {
        while !sleeper_killed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("sleeper should have been preempted");

    assert_eq!(sleeper_state.lock().unwrap().unwrap(), TaskState::Killed);
    assert_eq!(scheduler.get_task_state(quick_id).unwrap(), TaskState::Completed);
}

#[tokio::test]
async fn concurrent_admission_within_budget_all_run() {
    let scheduler = Scheduler::new(Resources::new(1000, 10000), 16);
    scheduler.start();

    let remaining = Arc::new(std::sync::atomic::AtomicU32::new(5));
    let all_done = Arc::new(tokio::sync::Notify::new());

    for _ in 0..5 {
        let remaining2 = Arc::clone(&remaining);
        let all_done2 = Arc::clone(&all_done);
        scheduler
            .schedule(TaskRequest {
                name: "concurrent".into(),
                resources: Resources::new(10, 10),
                command: Command::new("true", vec![], CmdExecType::Run),
                priority: 50,
                scheduling_retries: 3,
                on_launch_complete: Box::new(move |_| {
                    if remaining2.fetch_sub(1, Ordering::SeqCst) == 1 {
                        all_done2.notify_one();
                    }
                }),
                on_task_complete: None,
            })
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), all_done.notified())
        .await
        .expect("all tasks within budget should complete");
}
