//! Integration tests for eoka-pilot-host
//!
//! These tests require Chrome to be installed and available.
//! Run with: cargo test -p eoka-pilot-host --test chrome -- --ignored

use eoka_pilot_core::{
    BrowserConfig, ElementPresence, Host, InteractionOutcome, PageScript, RawObservation,
};
use eoka_pilot_host::EokaHost;
use std::time::Duration;

const LOGIN_PAGE: &str = r##"data:text/html,
    <title>Sign in</title>
    <label for="email">Email</label><input id="email" name="email" placeholder="you@example.com">
    <input type="password" name="password">
    <select name="country"><option value="de">Germany</option><option value="fr">France</option></select>
    <button class="primary">Sign in</button>
    <button class="primary">Create account</button>
    <a href="data:text/html,<title>Next</title>next page">Help</a>
"##;

/// Check if Chrome is available
fn chrome_available() -> bool {
    eoka::stealth::patcher::find_chrome().is_ok()
}

fn headless() -> BrowserConfig {
    BrowserConfig {
        headless: true,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_observe_query_order() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let host = EokaHost::launch(&headless())
        .await
        .expect("Failed to launch browser");
    let tab = host.open(LOGIN_PAGE).await.expect("Failed to open tab");

    let raw = host
        .run_script(&tab, &PageScript::Observe)
        .await
        .expect("Failed to observe");
    let obs: RawObservation = serde_json::from_value(raw).expect("Bad observation");

    assert_eq!(obs.title, "Sign in");
    assert_eq!(obs.inputs.len(), 3);
    assert_eq!(obs.inputs[0].selector, "#email");
    assert_eq!(obs.inputs[0].label, "Email");
    assert_eq!(obs.inputs[1].input_type, "password");
    assert_eq!(obs.inputs[2].input_type, "select");

    // Two buttons share a class, so both fall back to pseudo-selectors.
    assert_eq!(obs.actionables[0].selector, "btn_idx_0");
    assert_eq!(obs.actionables[1].selector, "btn_idx_1");
    assert_eq!(obs.actionables[2].tag, "a");

    host.close().await.expect("Failed to close browser");
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_fill_select_and_inspect() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let host = EokaHost::launch(&headless())
        .await
        .expect("Failed to launch browser");
    let tab = host.open(LOGIN_PAGE).await.expect("Failed to open tab");

    let fill = PageScript::Fill {
        selector: "idx_0".into(),
        value: "alice@example.com".into(),
    };
    let out: InteractionOutcome =
        serde_json::from_value(host.run_script(&tab, &fill).await.expect("Failed to fill"))
            .expect("Bad outcome");
    assert!(out.success);

    let select = PageScript::Select {
        selector: "[name=\"country\"]".into(),
        value: "France".into(),
    };
    let out: InteractionOutcome =
        serde_json::from_value(host.run_script(&tab, &select).await.expect("Failed to select"))
            .expect("Bad outcome");
    assert!(out.success);

    let missing = PageScript::Click {
        selector: "#nope".into(),
    };
    let out: InteractionOutcome =
        serde_json::from_value(host.run_script(&tab, &missing).await.expect("Failed to click"))
            .expect("Bad outcome");
    assert!(!out.success);
    assert_eq!(out.error.as_deref(), Some("element not found: #nope"));

    let presence: ElementPresence = serde_json::from_value(
        host.run_script(&tab, &PageScript::Inspect { selector: "#email".into() })
            .await
            .expect("Failed to inspect"),
    )
    .expect("Bad presence reply");
    assert!(presence.exists && presence.visible);

    host.close().await.expect("Failed to close browser");
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_navigation_publishes_load() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let host = EokaHost::launch(&headless())
        .await
        .expect("Failed to launch browser");
    let tab = host.open(LOGIN_PAGE).await.expect("Failed to open tab");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut loads = host.subscribe_loads();
    host.navigate(&tab, "data:text/html,<title>Done</title>done")
        .await
        .expect("Failed to navigate");
    let loaded = tokio::time::timeout(Duration::from_secs(10), loads.recv())
        .await
        .expect("No load event")
        .expect("Load channel closed");
    assert_eq!(loaded, tab);

    let info = host
        .tab_info(&tab)
        .await
        .expect("Failed to read tab")
        .expect("Tab vanished");
    assert_eq!(info.title, "Done");
    assert!(!info.loading);

    let shot = host.capture_visible(&tab).await.expect("Failed to capture");
    assert!(shot.starts_with(&[0x89, b'P', b'N', b'G']));

    host.close_tab(&tab).await.expect("Failed to close tab");
    assert!(host.tab_info(&tab).await.expect("tab_info").is_none());

    host.close().await.expect("Failed to close browser");
}
