// Utility commands on `cmd/#` against the virtual bench.

mod common;

use common::rig;
use serde_json::{json, Value};

fn round_robin(kind: &str, slots: &[&str]) -> Value {
    let pads: Vec<String> = (1..=slots.len()).map(|i| i.to_string()).collect();
    let muxes: Vec<String> = slots.iter().map(|s| format!("s{}", s)).collect();
    json!({
        "cmd": "round_robin", "type": kind,
        "pcb": "pcb", "pcb_virt": true,
        "slots": slots, "pads": pads, "mux_strings": muxes,
        "smu_address": "smu-1", "smu_virt": true
    })
}

fn mux_traffic(journal: &[String]) -> Vec<&str> {
    journal
        .iter()
        .filter_map(|e| e.strip_prefix("board:"))
        .filter(|c| *c == "iv" || c.starts_with('s'))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_rtd_round_robin_deselects_every_slot() {
    let mut rig = rig().await;
    rig.bench.set_rtd("A1", 1100.0);
    rig.send("cmd/round_robin", round_robin("rtd", &["A1", "A2"]))
        .await;
    rig.wait_utility("Temperature measurement complete.").await;

    let journal = rig.bench.journal();
    assert_eq!(
        mux_traffic(&journal),
        vec!["iv", "s", "sA1", "sA10", "sA2", "sA20", "s"]
    );
    assert_eq!(rig.bench.selected(), None);

    let logs = rig.utility_logs();
    assert!(logs
        .iter()
        .any(|l| l.starts_with("A1 -- 1 Could be a PT1000 RTD at 25.")));
    assert!(logs
        .iter()
        .any(|l| l.starts_with("A2 -- 2 Could be a PT1000 RTD at")));
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_reports_only_failures() {
    let mut rig = rig().await;
    rig.bench.open_contact("B2");
    rig.send(
        "cmd/round_robin",
        round_robin("connectivity", &["A1", "B2", "C3"]),
    )
    .await;
    rig.wait_utility("Contact check complete.").await;

    let logs = rig.utility_logs();
    assert!(logs.contains(&"Checking connections. Only failures will be printed.".to_string()));
    assert!(logs.contains(&"B2 -- 2 appears disconnected.".to_string()));
    assert!(!logs.iter().any(|l| l.contains("A1 --") || l.contains("C3 --")));
}

#[tokio::test(start_paused = true)]
async fn test_estop_is_handled_while_worker_is_busy() {
    let mut rig = rig().await;
    let slots: Vec<String> = (0..50).map(|i| format!("A{}", i)).collect();
    let slots: Vec<&str> = slots.iter().map(String::as_str).collect();
    rig.send("cmd/round_robin", round_robin("rtd", &slots)).await;
    rig.send("cmd/estop", json!({ "cmd": "estop", "pcb": "pcb", "pcb_virt": true }))
        .await;

    rig.wait_utility("Emergency stop command issued.").await;
    assert!(!rig
        .utility_logs()
        .iter()
        .any(|l| l == "Temperature measurement complete."));
    rig.wait_utility("Temperature measurement complete.").await;

    assert_eq!(rig.bench.count("board:b"), 1);
    assert_eq!(rig.factory.ledger().open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_task_is_rejected_while_one_runs() {
    let mut rig = rig().await;
    let slots: Vec<String> = (0..20).map(|i| format!("B{}", i)).collect();
    let slots: Vec<&str> = slots.iter().map(String::as_str).collect();
    rig.send("cmd/round_robin", round_robin("rtd", &slots)).await;
    let home = json!({ "cmd": "home", "pcb": "pcb", "stage_virt": true });
    rig.send("cmd/home", home.clone()).await;

    rig.wait_utility("Backend busy (task queue size = 1). Command rejected: home")
        .await;
    rig.wait_utility("Temperature measurement complete.").await;

    // The slot frees once the task is done
    rig.send("cmd/home", home).await;
    rig.wait_utility("Homing procedure complete.").await;
    let response = rig.wait_for("stage position", |d| d.topic == "response").await;
    assert_eq!(response.json().unwrap(), json!({ "pos": [0.0, 0.0] }));
}

#[tokio::test(start_paused = true)]
async fn test_goto_reports_the_new_position() {
    let mut rig = rig().await;
    rig.send(
        "cmd/goto",
        json!({ "cmd": "goto", "pcb": "pcb", "stage_virt": true, "pos": [10.0, 20.5] }),
    )
    .await;
    let response = rig.wait_for("stage position", |d| d.topic == "response").await;
    assert_eq!(response.json().unwrap(), json!({ "pos": [10.0, 20.5] }));

    rig.send(
        "cmd/read_stage",
        json!({ "cmd": "read_stage", "pcb": "pcb", "stage_virt": true }),
    )
    .await;
    let response = rig.wait_for("stage position", |d| d.topic == "response").await;
    assert_eq!(response.json().unwrap(), json!({ "pos": [10.0, 20.5] }));
}

#[tokio::test(start_paused = true)]
async fn test_pcb_select_deselects_first() {
    let mut rig = rig().await;
    rig.send(
        "cmd/for_pcb",
        json!({ "cmd": "for_pcb", "pcb": "pcb", "pcb_virt": true, "pcb_cmd": "sA1" }),
    )
    .await;
    rig.wait_utility("Command acknowledged: sA1").await;
    let journal = rig.bench.journal();
    assert_eq!(mux_traffic(&journal), vec!["s", "sA1"]);
    assert_eq!(rig.bench.selected().as_deref(), Some("A1"));

    rig.send(
        "cmd/for_pcb",
        json!({ "cmd": "for_pcb", "pcb": "pcb", "pcb_virt": true, "pcb_cmd": "zz" }),
    )
    .await;
    rig.wait_utility("Command zz not acknowledged with").await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_survives_a_dead_instrument() {
    let mut rig = rig().await;
    rig.send(
        "cmd/check_health",
        json!({
            "cmd": "check_health",
            "pcb": "pcb", "pcb_virt": true,
            "psu": "127.0.0.1:1",
            "smu_address": "smu-1", "smu_virt": true,
            "mono_address": "mono-1", "mono_virt": true,
            "le_address": "le-1", "le_virt": true, "le_recipe": "AM1.5_1.0SUN"
        }),
    )
    .await;
    rig.wait_utility("Light engine connection successful").await;

    let logs = rig.utility_logs();
    assert!(logs.contains(&"Controller firmware version: virtual-board 1.0".to_string()));
    assert!(logs.contains(&"Could not talk to power supply".to_string()));
    assert!(logs.contains(&"Sourcemeter looks virtually great!".to_string()));
    assert!(logs.contains(&"Monochromator looks virtually great!".to_string()));
    assert_eq!(rig.factory.ledger().open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mono_zero_and_spectrum() {
    let mut rig = rig().await;
    rig.send(
        "cmd/mono_zero",
        json!({ "cmd": "mono_zero", "mono_address": "mono-1", "mono_virt": true }),
    )
    .await;
    rig.wait_utility("1 FILTER virtually worked!").await;
    assert!(rig
        .utility_logs()
        .contains(&"0 GOTO virtually worked!".to_string()));

    rig.send(
        "cmd/spec",
        json!({ "cmd": "spec", "le_address": "le-1", "le_virt": true, "le_recipe": "AM1.5" }),
    )
    .await;
    let spectrum = rig
        .wait_for("spectrum", |d| d.topic == "calibration/spectrum")
        .await;
    let body = spectrum.json().unwrap();
    assert!(body["data"].as_array().is_some_and(|a| !a.is_empty()));
    assert!(body["timestamp"].as_f64().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unknown_commands() {
    let mut rig = rig().await;
    rig.send("cmd/goto", json!({ "cmd": "goto", "pcb": "pcb" })).await;
    rig.wait_utility("Malformed command on cmd/goto").await;

    // Unknown commands are dropped quietly; the loops keep going
    rig.send("cmd/dance", json!({ "cmd": "dance" })).await;
    rig.send(
        "cmd/mono_zero",
        json!({ "cmd": "mono_zero", "mono_address": "mono-1", "mono_virt": true }),
    )
    .await;
    rig.wait_utility("0 GOTO virtually worked!").await;
    assert!(!rig.utility_logs().iter().any(|l| l.contains("dance")));
}
