use super::*;

async fn create_friend_request_for_test(
    app: &axum::Router,
    session: &AuthResponse,
    recipient_user_id: &str,
) -> String {
    let (status, payload) = json_request(
        app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&session.token),
        Some(json!({"recipient_user_id": recipient_user_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    payload.unwrap()["request_id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn accepting_a_request_creates_a_symmetric_friendship() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.f@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.f@example.com", "Bob").await;
    let alice_id = user_id_from_me(&app, &alice).await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let request_id = create_friend_request_for_test(&app, &alice, &bob_id).await;

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/friends/requests/{request_id}/accept"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let friendship = payload.unwrap();
    assert_eq!(friendship["user_id"], bob_id);
    assert_eq!(friendship["friend_user_id"], alice_id);

    // The request is consumed and both sides see the friendship.
    for (session, expected_friend) in [(&alice, &bob_id), (&bob, &alice_id)] {
        let (status, payload) = json_request(
            &app,
            "GET",
            String::from("/api/friends/requests"),
            Some(&session.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payload = payload.unwrap();
        assert!(payload["incoming"].as_array().unwrap().is_empty());
        assert!(payload["outgoing"].as_array().unwrap().is_empty());

        let (status, payload) = json_request(
            &app,
            "GET",
            String::from("/api/friends"),
            Some(&session.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let friends = payload.unwrap();
        let friends = friends["friends"].as_array().unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0]["user_id"].as_str().unwrap(), expected_friend);
    }

    // Friendship blocks a new request in either direction.
    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&bob.token),
        Some(json!({"recipient_user_id": alice_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn pending_requests_block_duplicates_in_both_directions() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.d@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.d@example.com", "Bob").await;
    let alice_id = user_id_from_me(&app, &alice).await;
    let bob_id = user_id_from_me(&app, &bob).await;

    create_friend_request_for_test(&app, &alice, &bob_id).await;

    let (same_direction, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": bob_id})),
    )
    .await;
    assert_eq!(same_direction, StatusCode::CONFLICT);

    let (reverse_direction, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&bob.token),
        Some(json!({"recipient_user_id": alice_id})),
    )
    .await;
    assert_eq!(reverse_direction, StatusCode::CONFLICT);
}

#[tokio::test]
async fn only_the_recipient_may_accept_or_reject() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.a@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.a@example.com", "Bob").await;
    let mallory = register_and_login_as(&app, "mallory.a@example.com", "Mallory").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let request_id = create_friend_request_for_test(&app, &alice, &bob_id).await;

    for session in [&alice, &mallory] {
        let (status, _) = json_request(
            &app,
            "POST",
            format!("/api/friends/requests/{request_id}/accept"),
            Some(&session.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/friends/requests/{request_id}/reject"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The rejected request is gone.
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/friends/requests/{request_id}/accept"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sender_can_cancel_a_pending_request() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.c@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.c@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let request_id = create_friend_request_for_test(&app, &alice, &bob_id).await;

    // Only the sender may cancel.
    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/friends/requests/{request_id}"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/friends/requests/{request_id}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The cancellation is persisted for Bob, not just pushed.
    let (_, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&bob.token),
        None,
    )
    .await;
    let payload = payload.unwrap();
    let kinds: Vec<&str> = payload["notifications"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"friend_cancelled"));

    // A fresh request is allowed afterwards.
    create_friend_request_for_test(&app, &alice, &bob_id).await;
}

#[tokio::test]
async fn removing_a_friend_deletes_both_directed_rows() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.r@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.r@example.com", "Bob").await;
    let bob_id = user_id_from_me(&app, &bob).await;

    let request_id = create_friend_request_for_test(&app, &alice, &bob_id).await;
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/friends/requests/{request_id}/accept"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/friends/{bob_id}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    for session in [&alice, &bob] {
        let (status, payload) = json_request(
            &app,
            "GET",
            String::from("/api/friends"),
            Some(&session.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(payload.unwrap()["friends"].as_array().unwrap().is_empty());
    }

    // Removing again is a 404.
    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/friends/{bob_id}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn self_and_unknown_recipients_are_rejected() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.s@example.com", "Alice").await;
    let alice_id = user_id_from_me(&app, &alice).await;

    let (self_status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": alice_id})),
    )
    .await;
    assert_eq!(self_status, StatusCode::BAD_REQUEST);

    let (unknown_status, _) = json_request(
        &app,
        "POST",
        String::from("/api/friends/requests"),
        Some(&alice.token),
        Some(json!({"recipient_user_id": meetpoint_core::UserId::new().to_string()})),
    )
    .await;
    assert_eq!(unknown_status, StatusCode::NOT_FOUND);
}
