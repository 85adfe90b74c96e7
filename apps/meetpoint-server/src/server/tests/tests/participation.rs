use super::*;

async fn apply_for_test(app: &axum::Router, session: &AuthResponse, event_id: &str) -> String {
    let (status, payload) = json_request(
        app,
        "POST",
        format!("/api/events/{event_id}/apply"),
        Some(&session.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    payload.unwrap()["request_id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn accepting_an_application_adds_the_participant_and_consumes_the_request() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.pa@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.pa@example.com", "Bob").await;
    let event_id = create_event_for_test(&app, &alice, "Picnic", 5).await;

    let request_id = apply_for_test(&app, &bob, &event_id).await;

    // Bob cannot accept his own application.
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{request_id}/accept"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{request_id}/accept"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["participant_count"], 2);

    // The request is gone and Bob is in the event chat.
    let (_, requests) = json_request(
        &app,
        "GET",
        String::from("/api/participation/requests"),
        Some(&alice.token),
        None,
    )
    .await;
    let requests = requests.unwrap();
    assert!(requests["incoming"].as_array().unwrap().is_empty());

    let (_, bob_chats) = json_request(
        &app,
        "GET",
        String::from("/api/chats"),
        Some(&bob.token),
        None,
    )
    .await;
    let bob_chats = bob_chats.unwrap();
    let bob_chats = bob_chats["chats"].as_array().unwrap().clone();
    assert_eq!(bob_chats.len(), 1);
    assert_eq!(bob_chats[0]["event_id"], event_id);
}

#[tokio::test]
async fn accepting_at_capacity_fails_and_keeps_the_request_pending() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.cap@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.cap@example.com", "Bob").await;
    let charlie = register_and_login_as(&app, "charlie.cap@example.com", "Charlie").await;
    // One free seat beyond the creator.
    let event_id = create_event_for_test(&app, &alice, "Tiny Dinner", 2).await;

    let bob_request = apply_for_test(&app, &bob, &event_id).await;
    let charlie_request = apply_for_test(&app, &charlie, &event_id).await;

    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{bob_request}/accept"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{charlie_request}/accept"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload.unwrap()["error"], "event_full");

    // The request survives the failed acceptance.
    let (_, requests) = json_request(
        &app,
        "GET",
        String::from("/api/participation/requests"),
        Some(&alice.token),
        None,
    )
    .await;
    let requests = requests.unwrap();
    let incoming = requests["incoming"].as_array().unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0]["request_id"], charlie_request);

    // Once a seat frees up the pending request can be accepted.
    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/events/{event_id}/participants/me"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{charlie_request}/accept"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn duplicate_applications_and_full_events_are_rejected_up_front() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.dup@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.dup@example.com", "Bob").await;
    let charlie = register_and_login_as(&app, "charlie.dup@example.com", "Charlie").await;
    let event_id = create_event_for_test(&app, &alice, "Solo Show", 1).await;

    // Event is already at capacity with just the creator.
    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/apply"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload.unwrap()["error"], "event_full");

    let open_event = create_event_for_test(&app, &alice, "Open Show", 10).await;
    apply_for_test(&app, &charlie, &open_event).await;
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/events/{open_event}/apply"),
        Some(&charlie.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The creator is already a participant.
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/events/{open_event}/apply"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invitations_are_creator_initiated_and_invitee_accepted() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.inv@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.inv@example.com", "Bob").await;
    let alice_id = user_id_from_me(&app, &alice).await;
    let bob_id = user_id_from_me(&app, &bob).await;
    let event_id = create_event_for_test(&app, &alice, "Invite Only", 5).await;

    // Only the creator can invite, and not themselves.
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/invite"),
        Some(&bob.token),
        Some(json!({"user_id": bob_id})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/invite"),
        Some(&alice.token),
        Some(json!({"user_id": alice_id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/invite"),
        Some(&alice.token),
        Some(json!({"user_id": bob_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let invitation = payload.unwrap();
    assert_eq!(invitation["kind"], "invitation");
    let request_id = invitation["request_id"].as_str().unwrap().to_owned();

    // The invitation shows up as incoming for Bob, outgoing for Alice.
    let (_, bob_requests) = json_request(
        &app,
        "GET",
        String::from("/api/participation/requests"),
        Some(&bob.token),
        None,
    )
    .await;
    let bob_requests = bob_requests.unwrap();
    assert_eq!(bob_requests["incoming"].as_array().unwrap().len(), 1);
    let (_, alice_requests) = json_request(
        &app,
        "GET",
        String::from("/api/participation/requests"),
        Some(&alice.token),
        None,
    )
    .await;
    let alice_requests = alice_requests.unwrap();
    assert_eq!(alice_requests["outgoing"].as_array().unwrap().len(), 1);

    // The creator cannot accept on the invitee's behalf.
    let (status, _) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{request_id}/accept"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/participation/requests/{request_id}/accept"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["participant_count"], 2);
}

#[tokio::test]
async fn eligibility_flags_reflect_event_constraints() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.el@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.el@example.com", "Bob").await;

    // Bob is about 20 years old and male.
    let (status, _) = json_request(
        &app,
        "PATCH",
        String::from("/api/users/me"),
        Some(&bob.token),
        Some(json!({"birth_date_unix": 1_136_073_600_i64, "gender": "male"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, payload) = json_request(
        &app,
        "POST",
        String::from("/api/events"),
        Some(&alice.token),
        Some(json!({
            "title": "Adults Only",
            "starts_at_unix": 4_102_444_800_i64,
            "location": "Bar",
            "max_participants": 10,
            "min_age": 30,
            "gender_constraint": "female",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let event_id = payload.unwrap()["event_id"].as_str().unwrap().to_owned();

    let (status, payload) = json_request(
        &app,
        "POST",
        format!("/api/events/{event_id}/apply"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let request = payload.unwrap();
    assert_eq!(request["meets_age"], false);
    assert_eq!(request["meets_gender"], false);
}

#[tokio::test]
async fn the_initiator_may_cancel_a_pending_request() {
    let app = test_app();
    let alice = register_and_login_as(&app, "alice.cx@example.com", "Alice").await;
    let bob = register_and_login_as(&app, "bob.cx@example.com", "Bob").await;
    let event_id = create_event_for_test(&app, &alice, "Cancelable", 5).await;

    let request_id = apply_for_test(&app, &bob, &event_id).await;

    // The creator decides, but only the applicant may cancel.
    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/participation/requests/{request_id}"),
        Some(&alice.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(
        &app,
        "DELETE",
        format!("/api/participation/requests/{request_id}"),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The creator hears about the withdrawal even if they were offline.
    let (_, payload) = json_request(
        &app,
        "GET",
        String::from("/api/notifications"),
        Some(&alice.token),
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
    assert!(kinds.contains(&"application_cancelled"));
}
