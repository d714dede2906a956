/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use faultshell::runtime::drill::{self, DrillTargets};
use faultshell::test_utils::{RecordingSurface, always, orchestrate, test_platform};
use faultshell::{ChaosConfig, ChaosOrchestrator, LifecycleState, SetupOptions, VERSION};
use faultshell_runtime::{
    Cookie, Envelope, FetchRequest, FetchResponse, ResourceTimingEntry, StaticNetwork, WorkerSpec,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const PROFILE: &str = "https://app.faultshell.test/api/profile";

fn routed_platform() -> faultshell::Platform {
    let network = StaticNetwork::new();
    network.route(PROFILE, FetchResponse::json(&json!({"id": 1, "name": "ada"})));
    test_platform().with_network(Arc::new(network))
}

#[test]
fn scenarios_binary_smoke_runs() {
    assert!(!VERSION.is_empty());
}

#[tokio::test(start_paused = true)]
async fn network_only_safe_chaos_emits_one_recoverable_network_event() {
    let config = always(true).with_categories(["network"]);
    let (orchestrator, sink) = orchestrate(routed_platform(), config, 1);

    let _ = orchestrator
        .platform()
        .network
        .fetch(FetchRequest::get(Url::parse(PROFILE).unwrap()))
        .await;
    orchestrator.platform().storage.set("k", "v").unwrap();

    let history = orchestrator.get_history();
    assert_eq!(history.len(), 1);
    assert!(history[0].kind().starts_with("network."));
    assert!(history[0].recoverable());
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn disabled_chaos_is_indistinguishable_from_the_real_platform() {
    let real = routed_platform();
    let (orchestrator, sink) = orchestrate(routed_platform(), ChaosConfig::default(), 2);
    let wrapped = orchestrator.platform();

    for platform in [&real, wrapped] {
        platform.storage.set("draft", "{\"a\":1}").unwrap();
        platform.cookies.set(faultshell_runtime::Cookie::new("s", "1")).unwrap();
        platform.history.push_state(json!({"p": 1}), Some("/one")).unwrap();
    }
    assert_eq!(real.storage.get("draft"), wrapped.storage.get("draft"));
    assert_eq!(real.storage.keys(), wrapped.storage.keys());
    assert_eq!(real.cookies.get("s"), wrapped.cookies.get("s"));
    assert_eq!(real.history.location(), wrapped.history.location());

    let url = Url::parse(PROFILE).unwrap();
    let direct = real.network.fetch(FetchRequest::get(url.clone())).await.unwrap();
    let through = wrapped.network.fetch(FetchRequest::get(url)).await.unwrap();
    assert_eq!(direct.status, through.status);
    assert_eq!(direct.body, through.body);

    assert!(orchestrator.get_history().is_empty());
    assert!(sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabling_mid_session_stops_injection_without_setup() {
    let surface = RecordingSurface::new();
    let orchestrator = ChaosOrchestrator::setup(
        test_platform(),
        SetupOptions::default()
            .with_config(always(true).with_categories(["storage"]))
            .with_seed(3)
            .with_mount(surface.clone()),
    );
    let storage = orchestrator.platform().storage.clone();
    let _ = storage.set("a", "1");
    assert_eq!(orchestrator.get_history().len(), 1);

    surface.controls().unwrap().set_enabled(false);
    for round in 0..200 {
        let _ = storage.set("a", &round.to_string());
        let _ = storage.get("a");
    }
    assert_eq!(orchestrator.get_history().len(), 1);
    assert_eq!(storage.get("a").unwrap().as_deref(), Some("199"));
}

#[tokio::test]
async fn destroying_twice_tears_down_once() {
    let surface = RecordingSurface::new();
    let orchestrator = ChaosOrchestrator::setup(
        test_platform(),
        SetupOptions::default()
            .with_config(always(false))
            .with_mount(surface.clone()),
    );
    assert_eq!(RecordingSurface::count(&surface.mounts), 1);

    let first = orchestrator.destroy();
    assert!(first.is_clean());
    assert_eq!(first.cleaned.len(), orchestrator.handles().len());
    let second = orchestrator.destroy();
    assert!(second.already_destroyed);
    assert!(second.cleaned.is_empty());

    assert_eq!(RecordingSurface::count(&surface.unmounts), 1);
    assert!(surface.controls().is_none());
    assert_eq!(orchestrator.state(), LifecycleState::Destroyed);
    assert!(orchestrator.handles().iter().all(|status| status.detached));
}

#[tokio::test(start_paused = true)]
async fn setup_then_destroy_restores_real_behaviour() {
    let (orchestrator, sink) = orchestrate(routed_platform(), always(false), 4);
    orchestrator.destroy();
    let before = sink.len();

    let platform = orchestrator.platform();
    for index in 0..50 {
        platform.storage.set("k", &index.to_string()).unwrap();
        assert_eq!(platform.storage.get("k").unwrap(), Some(index.to_string()));
        let node = platform.dom.create_element("p");
        platform.dom.append_child(platform.dom.root(), node).unwrap();
    }
    assert_eq!(platform.dom.query_selector_all("p").len(), 50);
    platform.script.set_global("x", json!(5)).unwrap();
    assert_eq!(platform.script.global("x").unwrap(), json!(5));

    let url = Url::parse(PROFILE).unwrap();
    for _ in 0..20 {
        let response = platform.network.fetch(FetchRequest::get(url.clone())).await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(response.json_body(), Some(json!({"id": 1, "name": "ada"})));
    }

    for index in 0..20 {
        platform.cookies.set(Cookie::new("session", index.to_string())).unwrap();
        assert_eq!(platform.cookies.get("session").unwrap().value, index.to_string());
        platform
            .history
            .push_state(json!({"step": index}), Some(&format!("/step-{index}")))
            .unwrap();
        assert_eq!(platform.history.location().path(), format!("/step-{index}"));
    }

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let seen = delivered.clone();
    platform.events.subscribe(
        "orders",
        Arc::new(move |event: &Envelope| seen.lock().push(event.payload.clone())),
    );
    for index in 0..20 {
        assert_eq!(platform.events.publish(Envelope::new("orders", json!(index))), 1);
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*delivered.lock(), (0..20).map(|index| json!(index)).collect::<Vec<_>>());

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink_replies = replies.clone();
    let worker = platform
        .workers
        .spawn(WorkerSpec::new(
            "doubler",
            |message| message.as_i64().map(|n| json!(n * 2)),
            move |_, reply| sink_replies.lock().push(reply),
        ))
        .unwrap();
    for index in 0..20 {
        platform.workers.post(worker, json!(index)).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*replies.lock(), (0..20).map(|index| json!(index * 2)).collect::<Vec<_>>());
    assert!(platform.workers.terminate(worker));

    platform.database.create_store("users");
    for index in 0..20 {
        let key = format!("u{index}");
        platform.database.put("users", &key, json!({"n": index})).await.unwrap();
        assert_eq!(platform.database.get("users", &key).await.unwrap(), Some(json!({"n": index})));
    }

    for index in 0..20 {
        platform.timing.record(ResourceTimingEntry::new(format!("/asset-{index}"), "fetch"));
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    let names: Vec<String> = platform.timing.entries().into_iter().map(|entry| entry.name).collect();
    assert_eq!(names.len(), 20);
    assert!((0..20).all(|index| names.contains(&format!("/asset-{index}"))));

    assert_eq!(sink.len(), before);
    assert!(orchestrator.get_history().is_empty());
    assert!(!orchestrator.get_config().enabled);
}

#[tokio::test(start_paused = true)]
async fn clearing_history_then_one_fault_leaves_one_event() {
    let surface = RecordingSurface::new();
    let orchestrator = ChaosOrchestrator::setup(
        test_platform(),
        SetupOptions::default()
            .with_config(always(true).with_categories(["storage"]))
            .with_seed(5)
            .with_mount(surface.clone()),
    );
    let storage = orchestrator.platform().storage.clone();
    for _ in 0..5 {
        let _ = storage.set("k", "v");
    }
    assert_eq!(orchestrator.get_history().len(), 5);

    orchestrator.clear_history();
    assert!(orchestrator.get_history().is_empty());
    assert_eq!(RecordingSurface::count(&surface.clears), 1);

    let _ = storage.set("k", "v");
    assert_eq!(orchestrator.get_history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn safe_mode_drill_only_produces_recoverable_faults() {
    let (orchestrator, sink) = orchestrate(drill::drill_platform().unwrap(), always(true), 6);
    let targets = DrillTargets::in_memory().unwrap();
    let (stats, _) = drill::run(
        orchestrator.platform().clone(),
        targets,
        4,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(stats.rounds, 4);

    let history = orchestrator.get_history();
    assert!(!history.is_empty());
    assert!(history.iter().all(|event| event.recoverable()));
    let entries = sink.entries();
    assert_eq!(entries.len(), history.len());
    assert!(entries.iter().all(|entry| entry.category.starts_with("chaos.")));
    assert!(orchestrator.destroy().is_clean());
}

#[tokio::test(start_paused = true)]
async fn unsafe_drill_survives_and_tears_down_cleanly() {
    let (orchestrator, _sink) = orchestrate(drill::drill_platform().unwrap(), always(false), 7);
    let targets = DrillTargets::in_memory().unwrap();
    let (stats, _) = drill::run(
        orchestrator.platform().clone(),
        targets,
        4,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(stats.rounds, 4);
    assert!(stats.failures > 0);

    let report = orchestrator.destroy();
    assert!(report.is_clean());
    assert!(orchestrator.handles().iter().all(|status| status.detached));
}

#[tokio::test(start_paused = true)]
async fn history_stays_bounded_over_a_long_session() {
    let mut options = SetupOptions::default()
        .with_config(always(true).with_categories(["storage"]))
        .with_seed(8);
    options.history_capacity = 25;
    let orchestrator = ChaosOrchestrator::setup(test_platform(), options);
    let storage = orchestrator.platform().storage.clone();
    for index in 0..100 {
        let _ = storage.set(&format!("k{index}"), "v");
    }
    assert_eq!(orchestrator.get_history().len(), 25);
}
