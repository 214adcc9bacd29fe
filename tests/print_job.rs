mod common;

use common::{gcode_moves, test_config, wait_until, Rig};
use croma_rs::print_job::{shutdown_sequence, JobError};
use croma_rs::store::JobStore;
use croma_rs::ControllerError;
use croma_shared::api_models::PrinterState;
use croma_shared::print_job::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn position(commands: &[String], wanted: &str) -> usize {
    commands
        .iter()
        .position(|c| c == wanted)
        .unwrap_or_else(|| panic!("{wanted} was never sent"))
}

#[tokio::test(start_paused = true)]
async fn streams_whole_file_with_checkpoints() {
    let rig = Rig::new().await;
    let file = rig.gcode_file("part.gcode", &gcode_moves(120));

    let job_id = assert_ok!(rig.controller.start_job(file.id).await);
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));

    let job = rig.store.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_commands, 120);
    assert_eq!(job.commands_sent, 120);
    assert_eq!(job.failed_commands, 0);
    assert_eq!(job.progress, 100.0);
    assert!(job.completed_at.is_some());

    let checkpoints = rig.store.checkpoints(job_id);
    assert_eq!(&checkpoints[..2], &[41.7, 83.3]);
    assert!(checkpoints.windows(2).all(|w| w[0] <= w[1]));
    assert!(checkpoints.iter().all(|p| *p < 100.0));

    assert_eq!(rig.moves_sent(), (1..=120).collect::<Vec<_>>());
    let commands = rig.printer.commands();
    let g21 = position(&commands, "G21");
    let g90 = position(&commands, "G90");
    let m82 = position(&commands, "M82");
    let first_move = position(&commands, "G1 X1 Y1");
    assert!(g21 < g90 && g90 < m82 && m82 < first_move);
    assert!(commands[..g21].iter().any(|c| c == "M115"));

    let file = rig.store.file(file.id).unwrap();
    assert_eq!(file.print_count, 1);
    assert!(file.last_printed.is_some());
    assert!(file.estimated_duration_secs.is_some());
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_neither_repeat_nor_skip_commands() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let file = rig.gcode_file("cube.gcode", &gcode_moves(120));
    let job_id = assert_ok!(rig.controller.start_job(file.id).await);

    wait_until(|| rig.moves_sent().len() >= 20).await;
    assert_ok!(rig.controller.pause().await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let held = rig.moves_sent().len();
    assert!(held < 120);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.moves_sent().len(), held);

    let status = rig.controller.get_status().await;
    assert_eq!(status.state, PrinterState::Paused);
    assert_eq!(status.job.map(|j| j.id), Some(job_id));
    let again = assert_err!(rig.controller.pause().await);
    assert!(matches!(again, ControllerError::InvalidTransition(_)));

    assert_ok!(rig.controller.resume().await);
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));
    assert_eq!(rig.moves_sent(), (1..=120).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn stop_while_running_sends_shutdown_sequence_once() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let file = rig.gcode_file("cube.gcode", &gcode_moves(120));
    let job_id = assert_ok!(rig.controller.start_job(file.id).await);

    wait_until(|| rig.moves_sent().len() >= 10).await;
    assert_ok!(rig.controller.stop().await);
    assert_ok!(rig.controller.stop().await);
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Cancelled));

    assert_eq!(rig.printer.count("M108"), 1);
    let commands = rig.printer.commands();
    let expected = shutdown_sequence(rig.config.job.z_lift_mm);
    assert_eq!(&commands[commands.len() - expected.len()..], expected.as_slice());

    let job = rig.store.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.progress < 100.0);
    assert!(rig.moves_sent().len() < 120);
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused_sends_shutdown_sequence_once() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let file = rig.gcode_file("cube.gcode", &gcode_moves(120));
    assert_ok!(rig.controller.start_job(file.id).await);

    wait_until(|| rig.moves_sent().len() >= 10).await;
    assert_ok!(rig.controller.pause().await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let held = rig.moves_sent().len();

    assert_ok!(rig.controller.stop().await);
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Cancelled));
    assert_eq!(rig.printer.count("M108"), 1);
    assert_eq!(rig.printer.count("G28 X Y"), 1);
    assert_eq!(rig.moves_sent().len(), held);
}

#[tokio::test(start_paused = true)]
async fn starting_a_new_job_cancels_the_running_one() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let first = rig.gcode_file("first.gcode", &gcode_moves(120));
    let second = rig.gcode_file("second.gcode", &gcode_moves(30));

    let first_id = assert_ok!(rig.controller.start_job(first.id).await);
    wait_until(|| rig.moves_sent().len() >= 10).await;
    let second_id = assert_ok!(rig.controller.start_job(second.id).await);

    assert_eq!(rig.store.job(first_id).unwrap().status, JobStatus::Cancelled);
    let printing: Vec<_> = rig
        .controller
        .list_jobs()
        .into_iter()
        .filter(|j| j.status == JobStatus::Printing)
        .map(|j| j.id)
        .collect();
    assert_eq!(printing, vec![second_id]);

    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));
    assert_eq!(rig.printer.count("M108"), 1);
    let jobs = rig.controller.list_jobs();
    assert_eq!(jobs[0].id, second_id);
    assert_eq!(jobs[0].commands_sent, 30);
}

#[tokio::test(start_paused = true)]
async fn failed_setup_aborts_before_any_file_content() {
    let rig = Rig::new().await;
    rig.printer.swallow_ack("G21", 100);
    let file = rig.gcode_file("part.gcode", &gcode_moves(20));
    let job_id = assert_ok!(rig.controller.start_job(file.id).await);

    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Error));
    let job = rig.store.job(job_id).unwrap();
    assert!(job.error.unwrap().contains("G21"));
    assert!(job.completed_at.is_some());
    assert!(rig.moves_sent().is_empty());
    assert_eq!(rig.printer.count("G21"), rig.config.job.setup_retries as usize + 1);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_line_is_skipped_and_streaming_continues() {
    let rig = Rig::new().await;
    rig.printer.swallow_ack("G1 X5 ", 3);
    let file = rig.gcode_file("part.gcode", &gcode_moves(20));
    let job_id = assert_ok!(rig.controller.start_job(file.id).await);

    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));
    let job = rig.store.job(job_id).unwrap();
    assert_eq!(job.commands_sent, 20);
    assert_eq!(job.failed_commands, 1);
    assert_eq!(job.progress, 100.0);
    assert_eq!(rig.printer.count("G1 X5 "), 3);
}

#[tokio::test(start_paused = true)]
async fn losing_the_link_ends_the_job_in_error() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let file = rig.gcode_file("part.gcode", &gcode_moves(120));
    let job_id = assert_ok!(rig.controller.start_job(file.id).await);

    wait_until(|| rig.moves_sent().len() >= 10).await;
    rig.printer.unplug();
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Error));

    let job = rig.store.job(job_id).unwrap();
    assert!(job.error.is_some());
    assert!(job.progress < 100.0);
    assert_eq!(rig.printer.count("M108"), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_source_file_fails_the_job() {
    let rig = Rig::new().await;
    let file = rig.gcode_file("gone.gcode", &gcode_moves(5));
    std::fs::remove_file(&file.path).unwrap();

    let err = assert_err!(rig.controller.start_job(file.id).await);
    assert!(matches!(err, ControllerError::Job(JobError::SourceMissing(_))));
    let jobs = rig.controller.list_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn unknown_file_is_rejected_without_a_job_record() {
    let rig = Rig::new().await;
    let err = assert_err!(rig.controller.start_job(42).await);
    assert!(matches!(err, ControllerError::FileNotFound(42)));
    assert!(rig.controller.list_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_without_a_job_falls_back_to_sd_commands() {
    let rig = Rig::new().await;
    assert!(matches!(rig.controller.pause().await, Err(ControllerError::NoActiveJob)));

    assert_ok!(rig.controller.connect().await);
    rig.printer.set_sd_progress(100, 1000);
    assert_ok!(rig.controller.pause().await);
    assert!(rig.printer.sd_paused());
    assert_ok!(rig.controller.resume().await);
    assert!(!rig.printer.sd_paused());
    assert_ok!(rig.controller.stop().await);
    assert_eq!(rig.printer.count("M108"), 1);
}

#[tokio::test(start_paused = true)]
async fn replacing_a_job_on_an_unresponsive_printer_still_sends_full_shutdown() {
    let rig = Rig::new().await;
    rig.printer.set_latency(Duration::from_millis(10));
    let first = rig.gcode_file("first.gcode", &gcode_moves(120));
    let second = rig.gcode_file("second.gcode", &gcode_moves(30));
    let first_id = assert_ok!(rig.controller.start_job(first.id).await);
    wait_until(|| rig.moves_sent().len() >= 10).await;

    rig.printer.set_temperatures((205.0, 210.0), (60.0, 60.0));
    rig.printer.set_drop_probability(1.0);
    let second_id = assert_ok!(rig.controller.start_job(second.id).await);
    rig.printer.set_drop_probability(0.0);

    assert_eq!(rig.controller.job(first_id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(rig.printer.count("M108"), 1);
    let commands = rig.printer.commands();
    let expected = shutdown_sequence(rig.config.job.z_lift_mm);
    let start = position(&commands, "M108");
    assert_eq!(&commands[start..start + expected.len()], expected.as_slice());
    assert_eq!(rig.printer.nozzle_target(), 0.0);

    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));
    assert_eq!(rig.controller.job(second_id).unwrap().commands_sent, 30);
    assert_eq!(rig.printer.count("M108"), 1);
}

#[tokio::test(start_paused = true)]
async fn status_stays_responsive_while_a_job_is_being_replaced() {
    let mut config = test_config();
    config.job.heat_settle_ms = 60_000;
    let rig = Rig::build(config, None).await;
    let first = rig.gcode_file("hot.gcode", &format!("M109 S200\n{}", gcode_moves(10)));
    let second = rig.gcode_file("next.gcode", &gcode_moves(5));
    let first_id = assert_ok!(rig.controller.start_job(first.id).await);
    wait_until(|| rig.printer.count("M109") == 1).await;

    let swap = {
        let controller = Arc::clone(&rig.controller);
        tokio::spawn(async move { controller.start_job(second.id).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!swap.is_finished());

    let status = assert_ok!(tokio::time::timeout(Duration::from_millis(500), rig.controller.get_status()).await);
    assert_eq!(status.state, PrinterState::Printing);
    assert_eq!(status.job.map(|j| j.id), Some(first_id));

    assert_ok!(swap.await.unwrap());
    assert_eq!(rig.controller.job(first_id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(rig.printer.count("M108"), 1);
    assert_eq!(rig.controller.join_active_job().await, Some(JobStatus::Completed));
}
