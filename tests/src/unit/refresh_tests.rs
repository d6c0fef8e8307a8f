use crate::fixtures::{api_over, drain, settings, user_json};
use futures::future::join_all;
use parlor_core::transport::REFRESH_PATH;
use parlor_core::{ClientError, MockExchange, MockReply, Navigation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const ME: &str = "/api/auth/me";

fn expire_session_for(mock: &MockExchange, callers: usize) {
    let barrier = Arc::new(Barrier::new(callers));
    for _ in 0..callers {
        mock.on_get(ME, MockReply::status(401).gated(barrier.clone()));
    }
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh() {
    const CALLERS: usize = 5;
    let mock = MockExchange::new();
    expire_session_for(&mock, CALLERS);
    for id in 0..CALLERS {
        mock.on_get(ME, MockReply::json(200, user_json(id as i64, "ada@example.com")));
    }
    mock.on_post(
        REFRESH_PATH,
        MockReply::status(200).delayed(Duration::from_millis(30)),
    );
    let (api, mut navigation) = api_over(&mock, &settings());

    let results = join_all((0..CALLERS).map(|_| api.current_user())).await;

    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(mock.call_count(REFRESH_PATH), 1);
    assert_eq!(mock.call_count(ME), CALLERS * 2);
    assert!(!api.transport().refresh_in_flight());
    assert!(drain(&mut navigation).is_empty());
}

#[tokio::test]
async fn lock_clears_so_a_later_401_refreshes_again() {
    let mock = MockExchange::new();
    for _ in 0..2 {
        mock.on_get(ME, MockReply::status(401))
            .on_get(ME, MockReply::json(200, user_json(1, "ada@example.com")))
            .on_post(REFRESH_PATH, MockReply::status(204));
    }
    let (api, _navigation) = api_over(&mock, &settings());

    api.current_user().await.expect("first cycle");
    assert!(!api.transport().refresh_in_flight());
    api.current_user().await.expect("second cycle");

    assert_eq!(mock.call_count(REFRESH_PATH), 2);
    assert_eq!(mock.call_count(ME), 4);
}

#[tokio::test]
async fn failed_refresh_fails_every_waiter_and_redirects_once() {
    const CALLERS: usize = 3;
    let mock = MockExchange::new();
    expire_session_for(&mock, CALLERS);
    mock.on_post(
        REFRESH_PATH,
        MockReply::json(401, serde_json::json!({"detail": "Invalid refresh token"}))
            .delayed(Duration::from_millis(20)),
    );
    let (api, mut navigation) = api_over(&mock, &settings());
    api.transport().set_location("/dashboard");

    let results = join_all((0..CALLERS).map(|_| api.current_user())).await;

    for result in &results {
        assert!(matches!(result, Err(ClientError::Authentication { .. })));
    }
    assert_eq!(mock.call_count(REFRESH_PATH), 1);
    assert_eq!(mock.call_count(ME), CALLERS);
    assert_eq!(
        drain(&mut navigation),
        vec![Navigation::Login {
            to: "/auth/login".into(),
            redirect: "/dashboard".into(),
        }]
    );
}

#[tokio::test]
async fn stuck_refresh_times_out_and_releases_the_lock() {
    let mock = MockExchange::new();
    mock.on_get(ME, MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(200).hanging())
        .on_get(ME, MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(200))
        .on_get(ME, MockReply::json(200, user_json(1, "ada@example.com")));
    let settings = settings().with_refresh_timeout(Duration::from_millis(50));
    let (api, mut navigation) = api_over(&mock, &settings);

    let err = api.current_user().await.unwrap_err();
    match &err {
        ClientError::Authentication { reason } => assert!(reason.contains("timed out")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!api.transport().refresh_in_flight());
    assert_eq!(drain(&mut navigation).len(), 1);

    let user = api.current_user().await.expect("fresh cycle succeeds");
    assert_eq!(user.id, 1);
    assert_eq!(mock.call_count(REFRESH_PATH), 2);
}

#[tokio::test]
async fn retry_result_is_final_even_when_it_fails() {
    let mock = MockExchange::new();
    mock.on_get("/api/dashboard/onload", MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(200))
        .on_get(
            "/api/dashboard/onload",
            MockReply::json(503, serde_json::json!({"detail": "Service unavailable"})),
        );
    let (api, _navigation) = api_over(&mock, &settings());

    let err = api
        .page_data::<serde_json::Value>("dashboard")
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|status| status.as_u16()), Some(503));
    assert_eq!(err.user_message(), "Service unavailable");
    assert_eq!(mock.call_count("/api/dashboard/onload"), 2);
    assert_eq!(mock.call_count(REFRESH_PATH), 1);
}

#[tokio::test]
async fn auth_pages_get_no_redirect() {
    let mock = MockExchange::new();
    mock.on_get(ME, MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(401));
    let (api, mut navigation) = api_over(&mock, &settings());
    api.transport().set_location("/auth/login");

    assert!(api.current_user().await.unwrap_err().is_authentication());
    assert!(drain(&mut navigation).is_empty());
}
