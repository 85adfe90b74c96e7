use super::*;

async fn send_friend_request_for_test(
    app: &axum::Router,
    session: &AuthResponse,
    recipient_user_id: &str,
) {
    let (status, _) = json_request(
        app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&session.token),
        Some(json!({"recipient_user_id": recipient_user_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn side_effects_produce_notifications_newest_first() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.n@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.n@example.com", "Bob").await;
    let alice_id = user_id_from_me(&app, &alice).await;
    let bob_id = user_id_from_me(&app, &bob).await;

    send_friend_request_for_test(&app, &alice, &bob_id).await;

    let event_id = create_event_for_test(&app, &bob, "Board Games", 5).await;
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/apply"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payload = payload.unwrap();
    let notifications = payload["notifications"].as_array().unwrap();
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0]["kind"], "event_application");
    assert_eq!(notifications[0]["event_id"], event_id);
    assert_eq!(notifications[1]["kind"], "friend_request");
    assert_eq!(notifications[1]["actor_user_id"], alice_id);
    assert!(notifications.iter().all(|n| n["is_read"] == false));

    // The sender gets no notification for their own actions.
    let (_, alice_payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&alice.token),
        None,
    )
    .await;
    assert!(alice_payload.unwrap()["notifications"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn marking_all_notifications_read_zeroes_the_unread_count() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.nr@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.nr@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    send_friend_request_for_test(&app, &alice, &bob_id).await;

    let (status, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications/unread-count"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["unread"], 1);

    let (status, payload) = json_request(
        &app,
        "POST",
        String::from("/api/notifications/read"),
        Some(&bob.token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["unread"], 0);

    let (_, listed) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&bob.token),
        None,
    )
    .await;
    let listed = listed.unwrap();
    assert!(listed["notifications"]
        .as_array()
        .unwrap()
        .iter()
        .all(|n| n["is_read"] == true));
}

#[tokio::test]
async fn marking_specific_ids_leaves_the_rest_unread() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.ns@example.com", "Alice").await;
    let charlie = register_and_login_as(&app, "charlie.ns@example.com", "Charlie").await;
    let bob = register_and_login_as(&app, "bob.ns@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    send_friend_request_for_test(&app, &alice, &bob_id).await;
    send_friend_request_for_test(&app, &charlie, &bob_id).await;

    let (_, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&bob.token),
        None,
    )
    .await;
    let payload = payload.unwrap();
    let first_id = payload["notifications"][0]["notification_id"]
        .as_str()
        .unwrap()
        .to_owned();

    let (status, payload) = json_request(
        &app,
        "POST",
        String::from("/api/notifications/read"),
        Some(&bob.token),
        Some(json!({"notification_ids": [first_id.clone()]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["unread"], 1);

    let (_, listed) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&bob.token),
        None,
    )
    .await;
    let listed = listed.unwrap();
    for notification in listed["notifications"].as_array().unwrap() {
        let expect_read = notification["notification_id"] == first_id.as_str();
        assert_eq!(notification["is_read"].as_bool().unwrap(), expect_read);
    }
}

#[tokio::test]
async fn the_list_limit_is_honored() {
    let app = test_app();
    let bob = register_and_login_as(&app, "bob.nl@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    for n in 0..3 {
        let sender =
            register_and_login_as(&app, &format!("sender{n}.nl@example.com"), "Sender").await;
        send_friend_request_for_test(&app, &sender, &bob_id).await;
    }

    let (status, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications?limit=2"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["notifications"].as_array().unwrap().len(), 2);
}
